use crate::modules::archive::correspondent::Correspondent;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::profile::UserProfile;
use crate::modules::share::http::{check_share_response, connection_error, ShareHttpClient};
use crate::modules::share::vcard::to_vcard_stream;
use crate::raise_error;
use tracing::info;

/// Uploads correspondents to the user's contact server: HTTP PUT of a
/// vCard 3.0 stream under basic auth. Works for a single contact or a
/// batch.
pub async fn share_correspondents(
    owner_id: u64,
    correspondent_ids: &[u64],
) -> MailVaultResult<()> {
    let profile = UserProfile::get(owner_id).await?;
    let (url, username) = match (&profile.contact_share_url, &profile.contact_share_username) {
        (Some(url), Some(username)) => (url.clone(), username.clone()),
        _ => {
            return Err(raise_error!(
                "No contact server is configured for this user".into(),
                ErrorCode::MissingConfiguration
            ))
        }
    };
    let password = profile.contact_share_password.clone();

    let mut correspondents = Vec::with_capacity(correspondent_ids.len());
    for correspondent_id in correspondent_ids {
        let correspondent = Correspondent::get(*correspondent_id).await?;
        if correspondent.owner_id != owner_id {
            return Err(raise_error!(
                "Correspondent does not belong to this user".into(),
                ErrorCode::PermissionDenied
            ));
        }
        correspondents.push(correspondent);
    }
    if correspondents.is_empty() {
        return Err(raise_error!(
            "There are no correspondents to share".into(),
            ErrorCode::InvalidParameter
        ));
    }

    let body = to_vcard_stream(&correspondents);
    info!(
        "Sharing {} correspondent(s) to the contact server",
        correspondents.len()
    );

    let client = ShareHttpClient::new()?;
    let response = client
        .inner()
        .put(&url)
        .basic_auth(username, password)
        .header("Content-Type", "text/vcard; charset=utf-8")
        .body(body)
        .send()
        .await
        .map_err(connection_error)?;
    check_share_response(response).await?;
    info!("Successfully shared correspondents");
    Ok(())
}
