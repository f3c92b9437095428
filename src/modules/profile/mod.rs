use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::upsert_impl;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::raise_error;
use crate::utc_now;
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// Per-user configuration of the outbound share endpoints.
///
/// Consumed only by the share adapters; the archiving engine never reads it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 8, version = 1)]
#[native_db]
pub struct UserProfile {
    #[primary_key]
    pub owner_id: u64,
    /// Document-manager upload endpoint, bearer-token authenticated.
    pub document_share_url: Option<String>,
    pub document_share_token: Option<String>,
    /// Contact-server endpoint, basic-auth authenticated.
    pub contact_share_url: Option<String>,
    pub contact_share_username: Option<String>,
    pub contact_share_password: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserProfile {
    pub async fn get(owner_id: u64) -> MailVaultResult<UserProfile> {
        Self::find(owner_id).await?.ok_or_else(|| {
            raise_error!(
                format!("No profile configured for user '{owner_id}'"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find(owner_id: u64) -> MailVaultResult<Option<UserProfile>> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), owner_id).await
    }

    pub async fn save(&self) -> MailVaultResult<()> {
        let mut profile = self.clone();
        if profile.created_at == 0 {
            profile.created_at = utc_now!();
        }
        profile.updated_at = utc_now!();
        upsert_impl(DB_MANAGER.meta_db(), profile).await
    }
}
