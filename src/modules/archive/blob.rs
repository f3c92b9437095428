use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::modules::utils::sanitize_file_name;
use crate::raise_error;
use std::path::PathBuf;
use tracing::warn;

// Blob paths are content-addressed by entity id: the mailbox id prefixes
// every path and the email/attachment id prefixes the file name, so name
// collisions are impossible across entities.

/// `<mailbox_id>/<email_id>_<sanitized_message_id>.eml`
pub fn eml_relative_path(mailbox_id: u64, email_id: u64, message_id: &str) -> String {
    format!(
        "{}/{}_{}.eml",
        mailbox_id,
        email_id,
        sanitize_file_name(message_id)
    )
}

/// `<mailbox_id>/<email_id>/<attachment_id>_<sanitized_filename>`
pub fn attachment_relative_path(
    mailbox_id: u64,
    email_id: u64,
    attachment_id: u64,
    file_name: &str,
) -> String {
    format!(
        "{}/{}/{}_{}",
        mailbox_id,
        email_id,
        attachment_id,
        sanitize_file_name(file_name)
    )
}

pub fn absolute_path(relative: &str) -> PathBuf {
    DATA_DIR_MANAGER.blob_dir.join(relative)
}

pub async fn write_blob(relative: &str, data: &[u8]) -> MailVaultResult<()> {
    let path = absolute_path(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            raise_error!(
                format!("Failed to create blob dir {:?}: {}", parent, e),
                ErrorCode::InternalError
            )
        })?;
    }
    tokio::fs::write(&path, data).await.map_err(|e| {
        raise_error!(
            format!("Failed to write blob {:?}: {}", path, e),
            ErrorCode::InternalError
        )
    })
}

pub async fn remove_blob(relative: &str) {
    let path = absolute_path(relative);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!("Failed to remove blob {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eml_path_layout() {
        let path = eml_relative_path(7, 42, "<abc@e.test>");
        assert_eq!(path, "7/42_abc@e.test.eml");
    }

    #[test]
    fn test_attachment_path_layout() {
        let path = attachment_relative_path(7, 42, 9, "report final.pdf");
        assert_eq!(path, "7/42/9_report final.pdf");
    }

    #[test]
    fn test_paths_sanitize_separators() {
        let path = eml_relative_path(7, 42, "<../../etc/passwd>");
        assert!(!path.contains("..") || !path.contains("/etc/"));
        let path = attachment_relative_path(7, 42, 9, "..\\evil.exe");
        assert!(!path.contains('\\'));
    }
}
