use crate::modules::archive::attachment::Attachment;
use crate::modules::archive::correspondent::EmailCorrespondent;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    delete_impl, filter_by_secondary_key_impl, secondary_find_impl, update_impl,
};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One archived message.
///
/// Headers keep their original order and may repeat; keys are lowercased at
/// parse time. Reply-to and reference edges are weak relations to other
/// emails of the same user; deleting either endpoint just drops the edge.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 4, version = 1)]
#[native_db]
pub struct Email {
    #[primary_key]
    pub id: u64,
    #[secondary_key]
    pub mailbox_id: u64,
    /// (mailbox, message-id) uniqueness; the archive's duplicate guard.
    #[secondary_key(unique)]
    pub dedup_key: String,
    #[secondary_key]
    pub message_id: String,
    pub subject: String,
    /// Sent timestamp in UTC epoch milliseconds.
    pub sent_at: i64,
    pub plain_body: String,
    pub html_body: String,
    pub headers: Vec<(String, String)>,
    pub is_spam: bool,
    pub datasize: u64,
    /// Relative blob path of the raw .eml, when the mailbox keeps blobs.
    pub eml_path: Option<String>,
    /// Emails this one is a reply to (same owner only).
    pub reply_to: Vec<u64>,
    /// Emails this one references (same owner only).
    pub references: Vec<u64>,
    pub favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn email_dedup_key(mailbox_id: u64, message_id: &str) -> String {
    format!("{}:{}", mailbox_id, message_id)
}

impl Email {
    pub async fn get(email_id: u64) -> MailVaultResult<Email> {
        Self::find(email_id).await?.ok_or_else(|| {
            raise_error!(
                format!("Email with ID '{email_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find(email_id: u64) -> MailVaultResult<Option<Email>> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), email_id).await
    }

    pub async fn find_duplicate(
        mailbox_id: u64,
        message_id: &str,
    ) -> MailVaultResult<Option<Email>> {
        secondary_find_impl::<Email>(
            DB_MANAGER.meta_db(),
            EmailKey::dedup_key,
            email_dedup_key(mailbox_id, message_id),
        )
        .await
    }

    pub async fn list_for_mailbox(mailbox_id: u64) -> MailVaultResult<Vec<Email>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), EmailKey::mailbox_id, mailbox_id).await
    }

    /// All archived copies of a message-id, across every mailbox. Callers
    /// filter by owner before building edges.
    pub async fn list_by_message_id(message_id: &str) -> MailVaultResult<Vec<Email>> {
        filter_by_secondary_key_impl(
            DB_MANAGER.meta_db(),
            EmailKey::message_id,
            message_id.to_string(),
        )
        .await
    }

    pub async fn set_favorite(email_id: u64, favorite: bool) -> MailVaultResult<Email> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Email>(email_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Email with ID '{email_id}' not found"),
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
        Self::get(email_id).await
    }

    /// The raw message bytes from blob storage. `FileNotFound` when the
    /// mailbox was configured without .eml blobs or the file is gone.
    pub async fn stored_eml_bytes(&self) -> MailVaultResult<Vec<u8>> {
        let relative = self.eml_path.as_deref().ok_or_else(|| {
            raise_error!(
                format!("Email '{}' has no stored .eml file", self.id),
                ErrorCode::FileNotFound
            )
        })?;
        let path = DATA_DIR_MANAGER.blob_dir.join(relative);
        tokio::fs::read(&path).await.map_err(|e| {
            raise_error!(
                format!("Stored .eml '{}' could not be read: {}", relative, e),
                ErrorCode::FileNotFound
            )
        })
    }

    /// Deletes the email row, its attachments and correspondent edges, and
    /// its blobs. Reference edges pointing at this email are weak and are
    /// left to dangle harmlessly (lookups filter missing ids).
    pub async fn delete(email_id: u64) -> MailVaultResult<()> {
        let email = Self::get(email_id).await?;
        for attachment in Attachment::list_for_email(email_id).await? {
            Attachment::delete(attachment.id).await?;
        }
        EmailCorrespondent::delete_for_email(email_id).await?;
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<Email>(email_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Email '{}' not found during deletion.", email_id),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await?;
        if let Some(relative) = email.eml_path {
            let path = DATA_DIR_MANAGER.blob_dir.join(&relative);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove .eml blob {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}
