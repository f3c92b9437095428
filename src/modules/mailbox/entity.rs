use crate::modules::archive::email::Email;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    delete_impl, filter_by_secondary_key_impl, insert_impl, update_impl,
};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::health::Health;
use crate::modules::routine::entity::Routine;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::modules::utils::mailbox_id;
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Normalized role of a remote folder.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MailboxKind {
    Inbox,
    Sent,
    Drafts,
    Junk,
    Trash,
    Archive,
    #[default]
    Custom,
}

impl MailboxKind {
    /// Maps server-supplied special-use attributes and well-known folder
    /// names to the internal role. Unknown inputs fall to `Custom`.
    pub fn parse(value: &str) -> Self {
        match value.trim_start_matches('\\').to_ascii_lowercase().as_str() {
            "inbox" => MailboxKind::Inbox,
            "sent" => MailboxKind::Sent,
            "drafts" => MailboxKind::Drafts,
            "junk" | "spam" => MailboxKind::Junk,
            "trash" | "deleted" => MailboxKind::Trash,
            "archive" | "all" => MailboxKind::Archive,
            _ => MailboxKind::Custom,
        }
    }
}

impl fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MailboxKind::Inbox => "inbox",
            MailboxKind::Sent => "sent",
            MailboxKind::Drafts => "drafts",
            MailboxKind::Junk => "junk",
            MailboxKind::Trash => "trash",
            MailboxKind::Archive => "archive",
            MailboxKind::Custom => "custom",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct Mailbox {
    /// Derived from (account_id, name), which makes (account, name) unique.
    #[primary_key]
    pub id: u64,
    #[secondary_key]
    pub account_id: u64,
    /// The account-internal folder name. Must stay UTF-7 encodable for IMAP.
    pub name: String,
    pub kind: MailboxKind,
    /// Whether fetched messages keep their raw .eml blob.
    pub save_to_eml: bool,
    /// Whether attachment payloads are written to blob storage.
    pub save_attachments: bool,
    pub favorite: bool,
    pub health: Health,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Mailbox {
    pub fn new(account_id: u64, name: &str, kind: MailboxKind) -> Self {
        Mailbox {
            id: mailbox_id(account_id, name),
            account_id,
            name: name.to_string(),
            kind,
            save_to_eml: SETTINGS.mailvault_default_save_to_eml,
            save_attachments: SETTINGS.mailvault_default_save_attachments,
            favorite: false,
            health: Health::Healthy,
            last_error: None,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        }
    }

    pub async fn get(mailbox_id: u64) -> MailVaultResult<Mailbox> {
        Self::find(mailbox_id).await?.ok_or_else(|| {
            raise_error!(
                format!("Mailbox with ID '{mailbox_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find(mailbox_id: u64) -> MailVaultResult<Option<Mailbox>> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), mailbox_id).await
    }

    pub async fn find_by_name(account_id: u64, name: &str) -> MailVaultResult<Option<Mailbox>> {
        Self::find(mailbox_id(account_id, name)).await
    }

    pub async fn list_for_account(account_id: u64) -> MailVaultResult<Vec<Mailbox>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), MailboxKey::account_id, account_id)
            .await
    }

    pub async fn save(&self) -> MailVaultResult<()> {
        insert_impl(DB_MANAGER.meta_db(), self.to_owned()).await
    }

    /// The fetching criteria this mailbox can legally be fetched with,
    /// derived from the account protocol.
    pub async fn available_fetching_criteria(&self) -> MailVaultResult<Vec<FetchCriterion>> {
        let account = crate::modules::account::entity::Account::get(self.account_id).await?;
        Ok(FetchCriterion::available_for(account.protocol))
    }

    pub async fn set_flags(
        mailbox_id: u64,
        save_to_eml: Option<bool>,
        save_attachments: Option<bool>,
        favorite: Option<bool>,
    ) -> MailVaultResult<Mailbox> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Mailbox>(mailbox_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Mailbox with ID '{mailbox_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                if let Some(save_to_eml) = save_to_eml {
                    updated.save_to_eml = save_to_eml;
                }
                if let Some(save_attachments) = save_attachments {
                    updated.save_attachments = save_attachments;
                }
                if let Some(favorite) = favorite {
                    updated.favorite = favorite;
                }
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(mailbox_id).await
    }

    /// Refreshes the folder role, for migration of mailboxes recorded
    /// before the server reclassified them.
    pub async fn set_kind(mailbox_id: u64, kind: MailboxKind) -> MailVaultResult<Mailbox> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Mailbox>(mailbox_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Mailbox with ID '{mailbox_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.kind = kind;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(mailbox_id).await
    }

    /// Sets the health flag; `Ok(true)` means the flag transitioned.
    pub async fn set_health(
        mailbox_id: u64,
        health: Health,
        last_error: Option<String>,
    ) -> MailVaultResult<bool> {
        let previous = update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Mailbox>(mailbox_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Mailbox with ID '{mailbox_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.health = health;
                updated.last_error = last_error;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Ok(previous.health != health)
    }

    /// Deletes the mailbox with everything it owns: routines, emails,
    /// attachments, correspondent edges, and the blob directory.
    pub async fn delete(mailbox_id: u64) -> MailVaultResult<()> {
        for routine in Routine::list_for_mailbox(mailbox_id).await? {
            Routine::delete(routine.id).await?;
        }
        let emails = Email::list_for_mailbox(mailbox_id).await?;
        for email in &emails {
            Email::delete(email.id).await?;
        }
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<Mailbox>(mailbox_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Mailbox '{}' not found during deletion.", mailbox_id),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await?;
        let blob_dir = DATA_DIR_MANAGER.blob_dir.join(mailbox_id.to_string());
        if blob_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&blob_dir).await {
                warn!("Failed to remove blob dir {:?}: {}", blob_dir, e);
            }
        }
        info!("Deleted mailbox {} with {} emails", mailbox_id, emails.len());
        Ok(())
    }

    /// Whether a remote folder name is excluded from account scans.
    pub fn is_ignored(name: &str) -> bool {
        match SETTINGS.ignored_mailboxes_regex() {
            Some(regex) => {
                let ignored = regex.is_match(name);
                if ignored {
                    debug!("'{}' is in the ignorelist, it is skipped.", name);
                }
                ignored
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mailbox_kind_from_attributes() {
        assert_eq!(MailboxKind::parse("\\Junk"), MailboxKind::Junk);
        assert_eq!(MailboxKind::parse("\\Sent"), MailboxKind::Sent);
        assert_eq!(MailboxKind::parse("\\Drafts"), MailboxKind::Drafts);
        assert_eq!(MailboxKind::parse("\\All"), MailboxKind::Archive);
        assert_eq!(MailboxKind::parse("spam"), MailboxKind::Junk);
        assert_eq!(MailboxKind::parse("INBOX"), MailboxKind::Inbox);
        assert_eq!(MailboxKind::parse("\\Weird"), MailboxKind::Custom);
    }

    #[test]
    fn test_mailbox_id_is_stable_per_account_and_name() {
        let a = Mailbox::new(1, "INBOX", MailboxKind::Inbox);
        let b = Mailbox::new(1, "INBOX", MailboxKind::Inbox);
        let c = Mailbox::new(2, "INBOX", MailboxKind::Inbox);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }
}
