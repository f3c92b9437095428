use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{delete_impl, filter_by_secondary_key_impl, update_impl};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 5, version = 1)]
#[native_db]
pub struct Attachment {
    #[primary_key]
    pub id: u64,
    #[secondary_key]
    pub email_id: u64,
    pub file_name: String,
    pub content_maintype: String,
    pub content_subtype: String,
    pub content_disposition: Option<String>,
    /// Content-ID with its angle brackets preserved, when present.
    pub content_id: Option<String>,
    pub datasize: u64,
    /// Relative blob path; set only when the mailbox saves attachments.
    /// The attachment id in the path makes it unique per email.
    pub file_path: Option<String>,
    pub favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Attachment {
    pub async fn get(attachment_id: u64) -> MailVaultResult<Attachment> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), attachment_id)
            .await?
            .ok_or_else(|| {
                raise_error!(
                    format!("Attachment with ID '{attachment_id}' not found"),
                    ErrorCode::ResourceNotFound
                )
            })
    }

    pub async fn list_for_email(email_id: u64) -> MailVaultResult<Vec<Attachment>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), AttachmentKey::email_id, email_id).await
    }

    pub fn content_type(&self) -> String {
        format!("{}/{}", self.content_maintype, self.content_subtype)
    }

    /// The attachment payload from blob storage.
    pub async fn stored_bytes(&self) -> MailVaultResult<Vec<u8>> {
        let relative = self.file_path.as_deref().ok_or_else(|| {
            raise_error!(
                format!("Attachment '{}' has no stored file", self.id),
                ErrorCode::FileNotFound
            )
        })?;
        let path = DATA_DIR_MANAGER.blob_dir.join(relative);
        tokio::fs::read(&path).await.map_err(|e| {
            raise_error!(
                format!("Stored attachment '{}' could not be read: {}", relative, e),
                ErrorCode::FileNotFound
            )
        })
    }

    pub async fn set_favorite(attachment_id: u64, favorite: bool) -> MailVaultResult<Attachment> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Attachment>(attachment_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Attachment with ID '{attachment_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.favorite = favorite;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(attachment_id).await
    }

    pub async fn delete(attachment_id: u64) -> MailVaultResult<()> {
        let attachment = Self::get(attachment_id).await?;
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<Attachment>(attachment_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Attachment '{}' not found during deletion.", attachment_id),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await?;
        if let Some(relative) = attachment.file_path {
            let path = DATA_DIR_MANAGER.blob_dir.join(&relative);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove attachment blob {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}
