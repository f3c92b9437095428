use crate::modules::archive::attachment::Attachment;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::profile::UserProfile;
use crate::modules::share::http::{check_share_response, connection_error, ShareHttpClient};
use crate::raise_error;
use tracing::info;

/// Uploads one archived attachment to the user's document manager:
/// HTTP POST of the file under a bearer token. Archive state is never
/// mutated.
pub async fn share_attachment(owner_id: u64, attachment_id: u64) -> MailVaultResult<()> {
    let profile = UserProfile::get(owner_id).await?;
    let (url, token) = match (&profile.document_share_url, &profile.document_share_token) {
        (Some(url), Some(token)) => (url.clone(), token.clone()),
        _ => {
            return Err(raise_error!(
                "No document manager is configured for this user".into(),
                ErrorCode::MissingConfiguration
            ))
        }
    };

    let attachment = Attachment::get(attachment_id).await?;
    let data = attachment.stored_bytes().await?;
    info!(
        "Sharing attachment '{}' ({} bytes) to the document manager",
        attachment.file_name,
        data.len()
    );

    let part = reqwest::multipart::Part::bytes(data)
        .file_name(attachment.file_name.clone())
        .mime_str(&attachment.content_type())
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    let form = reqwest::multipart::Form::new().part("document", part);

    let client = ShareHttpClient::new()?;
    let response = client
        .inner()
        .post(&url)
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await
        .map_err(connection_error)?;
    check_share_response(response).await?;
    info!("Successfully shared attachment '{}'", attachment.file_name);
    Ok(())
}
