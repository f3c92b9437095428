use crate::id;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    batch_delete_impl, filter_by_secondary_key_impl, insert_impl, secondary_find_impl, update_impl,
};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header field an email mentioned a correspondent in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Mention {
    From,
    To,
    Cc,
    Bcc,
    ReplyTo,
    Sender,
    ReturnPath,
    EnvelopeTo,
}

impl fmt::Display for Mention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Mention::From => "from",
            Mention::To => "to",
            Mention::Cc => "cc",
            Mention::Bcc => "bcc",
            Mention::ReplyTo => "reply-to",
            Mention::Sender => "sender",
            Mention::ReturnPath => "return-path",
            Mention::EnvelopeTo => "envelope-to",
        };
        write!(f, "{}", tag)
    }
}

/// List-serv headers captured from list traffic, RFC 2369/2919.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ListServHeaders {
    pub list_id: Option<String>,
    pub list_owner: Option<String>,
    pub list_subscribe: Option<String>,
    pub list_unsubscribe: Option<String>,
    pub list_post: Option<String>,
    pub list_help: Option<String>,
    pub list_archive: Option<String>,
    pub list_unsubscribe_post: Option<String>,
}

impl ListServHeaders {
    pub fn is_empty(&self) -> bool {
        self.list_id.is_none()
            && self.list_owner.is_none()
            && self.list_subscribe.is_none()
            && self.list_unsubscribe.is_none()
            && self.list_post.is_none()
            && self.list_help.is_none()
            && self.list_archive.is_none()
            && self.list_unsubscribe_post.is_none()
    }
}

/// A unique contact of one user. Many emails may reference the same
/// correspondent; the address is unique per owner, case-insensitively.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 6, version = 1)]
#[native_db]
pub struct Correspondent {
    #[primary_key]
    pub id: u64,
    #[secondary_key]
    pub owner_id: u64,
    /// `{owner}:{address lowercased}`.
    #[secondary_key(unique)]
    pub address_key: String,
    pub address: String,
    /// Display name as captured from headers.
    pub display_name: Option<String>,
    /// User-supplied real name, never overwritten by archiving.
    pub real_name: Option<String>,
    pub list_serv: ListServHeaders,
    pub favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn correspondent_address_key(owner_id: u64, address: &str) -> String {
    format!("{}:{}", owner_id, address.to_lowercase())
}

impl Correspondent {
    pub async fn get(correspondent_id: u64) -> MailVaultResult<Correspondent> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), correspondent_id)
            .await?
            .ok_or_else(|| {
                raise_error!(
                    format!("Correspondent with ID '{correspondent_id}' not found"),
                    ErrorCode::ResourceNotFound
                )
            })
    }

    pub async fn find_by_address(
        owner_id: u64,
        address: &str,
    ) -> MailVaultResult<Option<Correspondent>> {
        secondary_find_impl::<Correspondent>(
            DB_MANAGER.meta_db(),
            CorrespondentKey::address_key,
            correspondent_address_key(owner_id, address),
        )
        .await
    }

    pub async fn list_for_owner(owner_id: u64) -> MailVaultResult<Vec<Correspondent>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), CorrespondentKey::owner_id, owner_id)
            .await
    }

    /// Idempotent upsert keyed by (owner, address). Concurrent writers race
    /// on the unique key; the loser re-reads and returns the winner's row.
    /// Display name and list-serv headers are filled in when still missing.
    pub async fn upsert(
        owner_id: u64,
        address: &str,
        display_name: Option<String>,
        list_serv: ListServHeaders,
    ) -> MailVaultResult<Correspondent> {
        if let Some(existing) = Self::find_by_address(owner_id, address).await? {
            return Self::merge_header_data(existing.id, display_name, list_serv).await;
        }
        let entity = Correspondent {
            id: id!(64),
            owner_id,
            address_key: correspondent_address_key(owner_id, address),
            address: address.to_string(),
            display_name,
            real_name: None,
            list_serv,
            favorite: false,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        };
        match insert_impl(DB_MANAGER.meta_db(), entity.clone()).await {
            Ok(()) => Ok(entity),
            // Unique-constraint loss against a concurrent writer.
            Err(_) => Self::find_by_address(owner_id, address).await?.ok_or_else(|| {
                raise_error!(
                    format!("Correspondent upsert failed for '{}'", address),
                    ErrorCode::InternalError
                )
            }),
        }
    }

    async fn merge_header_data(
        correspondent_id: u64,
        display_name: Option<String>,
        list_serv: ListServHeaders,
    ) -> MailVaultResult<Correspondent> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Correspondent>(correspondent_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Correspondent with ID '{correspondent_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                if updated.display_name.is_none() {
                    updated.display_name = display_name;
                }
                if updated.list_serv.is_empty() && !list_serv.is_empty() {
                    updated.list_serv = list_serv;
                }
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(correspondent_id).await
    }

    pub async fn set_favorite(
        correspondent_id: u64,
        favorite: bool,
    ) -> MailVaultResult<Correspondent> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Correspondent>(correspondent_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Correspondent with ID '{correspondent_id}' not found"),
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
        Self::get(correspondent_id).await
    }

    pub async fn set_real_name(
        correspondent_id: u64,
        real_name: Option<String>,
    ) -> MailVaultResult<Correspondent> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Correspondent>(correspondent_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Correspondent with ID '{correspondent_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.real_name = real_name;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(correspondent_id).await
    }
}

/// Directed edge between one email and one correspondent, tagged with the
/// header field the correspondent appeared in.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 7, version = 1)]
#[native_db]
pub struct EmailCorrespondent {
    #[primary_key]
    pub id: u64,
    #[secondary_key]
    pub email_id: u64,
    #[secondary_key]
    pub correspondent_id: u64,
    /// `{email}:{correspondent}:{mention}` uniqueness.
    #[secondary_key(unique)]
    pub edge_key: String,
    pub mention: Mention,
    pub created_at: i64,
}

pub fn edge_key(email_id: u64, correspondent_id: u64, mention: Mention) -> String {
    format!("{}:{}:{}", email_id, correspondent_id, mention)
}

impl EmailCorrespondent {
    pub fn new(email_id: u64, correspondent_id: u64, mention: Mention) -> Self {
        EmailCorrespondent {
            id: id!(64),
            email_id,
            correspondent_id,
            edge_key: edge_key(email_id, correspondent_id, mention),
            mention,
            created_at: utc_now!(),
        }
    }

    pub async fn list_for_email(email_id: u64) -> MailVaultResult<Vec<EmailCorrespondent>> {
        filter_by_secondary_key_impl(
            DB_MANAGER.meta_db(),
            EmailCorrespondentKey::email_id,
            email_id,
        )
        .await
    }

    pub async fn list_for_correspondent(
        correspondent_id: u64,
    ) -> MailVaultResult<Vec<EmailCorrespondent>> {
        filter_by_secondary_key_impl(
            DB_MANAGER.meta_db(),
            EmailCorrespondentKey::correspondent_id,
            correspondent_id,
        )
        .await
    }

    pub async fn delete_for_email(email_id: u64) -> MailVaultResult<usize> {
        batch_delete_impl(DB_MANAGER.meta_db(), move |rw| {
            let edges: Vec<EmailCorrespondent> = rw
                .scan()
                .secondary(EmailCorrespondentKey::email_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .start_with(email_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            Ok(edges)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_owner_and_address() {
        let first = Correspondent::upsert(11, "A@Example.Test", None, Default::default())
            .await
            .unwrap();
        let second = Correspondent::upsert(
            11,
            "a@example.test",
            Some("Alice".into()),
            Default::default(),
        )
        .await
        .unwrap();
        assert_eq!(first.id, second.id);
        // The second sighting filled in the missing display name.
        assert_eq!(second.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_same_address_is_distinct_across_owners() {
        let one = Correspondent::upsert(12, "shared@example.test", None, Default::default())
            .await
            .unwrap();
        let two = Correspondent::upsert(13, "shared@example.test", None, Default::default())
            .await
            .unwrap();
        assert_ne!(one.id, two.id);
    }

    #[tokio::test]
    async fn test_display_name_is_not_overwritten() {
        let first = Correspondent::upsert(
            14,
            "keep@example.test",
            Some("Original".into()),
            Default::default(),
        )
        .await
        .unwrap();
        let second = Correspondent::upsert(
            14,
            "keep@example.test",
            Some("Changed".into()),
            Default::default(),
        )
        .await
        .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("Original"));
    }
}
