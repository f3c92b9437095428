use crate::modules::error::code::ErrorCode;
use crate::modules::error::{MailVaultError, MailVaultResult};
use crate::{mailvault_version, raise_error};
use std::time::Duration;

/// Thin reqwest wrapper shared by the outbound share adapters. Pure
/// pass-through: nothing here touches archive state.
pub struct ShareHttpClient {
    client: reqwest::Client,
}

impl ShareHttpClient {
    pub fn new() -> MailVaultResult<ShareHttpClient> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(format!("MailVault/{}", mailvault_version!()))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                raise_error!(
                    format!("Failed to build HTTP client: {:#?}", e),
                    ErrorCode::InternalError
                )
            })?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Maps a share-endpoint response to the adapter error contract:
/// 401/403 become permission errors, other failures carry the server text.
pub async fn check_share_response(response: reqwest::Response) -> MailVaultResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(raise_error!(
            format!("The share endpoint rejected the credentials ({})", status),
            ErrorCode::PermissionDenied
        ));
    }
    Err(raise_error!(
        format!("The share endpoint answered {}: {}", status, body),
        ErrorCode::HttpResponseError
    ))
}

pub fn connection_error(error: reqwest::Error) -> MailVaultError {
    raise_error!(
        format!("Could not reach the share endpoint: {}", error),
        ErrorCode::NetworkError
    )
}
