use crate::id;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    delete_impl, filter_by_secondary_key_impl, insert_impl, list_all_impl, secondary_find_impl,
    update_impl,
};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::health::Health;
use crate::modules::mailbox::entity::Mailbox;
use crate::{decrypt, encrypt, raise_error, utc_now, validate_email};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// The wire protocol of a remote mail account. Selected at creation and
/// immutable afterwards; changing it means re-creating the account.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MailProtocol {
    #[default]
    Imap,
    ImapTls,
    Pop3,
    Pop3Tls,
    Jmap,
    Exchange,
}

impl MailProtocol {
    pub fn default_port(&self) -> u16 {
        match self {
            MailProtocol::Imap => 143,
            MailProtocol::ImapTls => 993,
            MailProtocol::Pop3 => 110,
            MailProtocol::Pop3Tls => 995,
            MailProtocol::Jmap => 443,
            MailProtocol::Exchange => 993,
        }
    }

    /// Whether sessions for this protocol run over implicit TLS. Exchange
    /// rides the IMAP-over-TLS path until it has a client of its own.
    pub fn uses_tls(&self) -> bool {
        matches!(
            self,
            MailProtocol::ImapTls
                | MailProtocol::Pop3Tls
                | MailProtocol::Jmap
                | MailProtocol::Exchange
        )
    }
}

impl fmt::Display for MailProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MailProtocol::Imap => "IMAP",
            MailProtocol::ImapTls => "IMAP_TLS",
            MailProtocol::Pop3 => "POP3",
            MailProtocol::Pop3Tls => "POP3_TLS",
            MailProtocol::Jmap => "JMAP",
            MailProtocol::Exchange => "EXCHANGE",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct Account {
    #[primary_key]
    pub id: u64,
    /// The user this account belongs to. Every entity reachable from the
    /// account is owned by the same user.
    #[secondary_key]
    pub owner_id: u64,
    /// (owner, address, protocol) uniqueness.
    #[secondary_key(unique)]
    pub identity_key: String,
    /// Mail address used to log in. Case-preserving.
    pub email: String,
    /// Password or API token, stored reversibly (it is replayed to the
    /// server on every connect).
    pub secret: String,
    pub host: String,
    /// Explicit server port; the protocol default when unset.
    pub port: Option<u16>,
    pub protocol: MailProtocol,
    /// Timeout applied to every remote operation of this account.
    pub timeout_secs: u64,
    /// Per-account opt-in for relaxed TLS verification. Only effective when
    /// the process-wide allow-insecure flag is also set.
    pub allow_insecure_tls: bool,
    pub health: Health,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct AccountCreateRequest {
    pub owner_id: u64,
    pub email: String,
    pub secret: String,
    pub host: String,
    pub port: Option<u16>,
    pub protocol: MailProtocol,
    pub timeout_secs: Option<u64>,
    pub allow_insecure_tls: bool,
}

pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

fn identity_key(owner_id: u64, email: &str, protocol: MailProtocol) -> String {
    format!("{}:{}:{}", owner_id, email, protocol)
}

impl Account {
    pub fn create_entity(request: AccountCreateRequest) -> MailVaultResult<Self> {
        validate_email!(&request.email)?;
        Ok(Account {
            id: id!(64),
            owner_id: request.owner_id,
            identity_key: identity_key(request.owner_id, &request.email, request.protocol),
            email: request.email,
            secret: encrypt!(&request.secret)?,
            host: request.host,
            port: request.port,
            protocol: request.protocol,
            timeout_secs: request.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS),
            allow_insecure_tls: request.allow_insecure_tls,
            health: Health::Unknown,
            last_error: None,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        })
    }

    /// Creates and persists a new account. The caller decides whether to run
    /// a live connection test first (account creation from the control plane
    /// does; imports do not).
    pub async fn create(request: AccountCreateRequest) -> MailVaultResult<Account> {
        let entity = Self::create_entity(request)?;
        if Self::find_by_identity(
            entity.owner_id,
            &entity.email,
            entity.protocol,
        )
        .await?
        .is_some()
        {
            return Err(raise_error!(
                format!(
                    "Account '{}' with protocol {} already exists for this user",
                    entity.email, entity.protocol
                ),
                ErrorCode::AlreadyExists
            ));
        }
        insert_impl(DB_MANAGER.meta_db(), entity.clone()).await?;
        info!("Created account '{}' ({})", entity.email, entity.protocol);
        Ok(entity)
    }

    pub async fn get(account_id: u64) -> MailVaultResult<Account> {
        Self::find(account_id).await?.ok_or_else(|| {
            raise_error!(
                format!("Account with ID '{account_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find(account_id: u64) -> MailVaultResult<Option<Account>> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), account_id).await
    }

    pub async fn find_by_identity(
        owner_id: u64,
        email: &str,
        protocol: MailProtocol,
    ) -> MailVaultResult<Option<Account>> {
        secondary_find_impl::<Account>(
            DB_MANAGER.meta_db(),
            AccountKey::identity_key,
            identity_key(owner_id, email, protocol),
        )
        .await
    }

    pub async fn list_all() -> MailVaultResult<Vec<Account>> {
        list_all_impl(DB_MANAGER.meta_db()).await
    }

    pub async fn list_for_owner(owner_id: u64) -> MailVaultResult<Vec<Account>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), AccountKey::owner_id, owner_id).await
    }

    /// Effective server port, falling back to the protocol default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Decrypted login secret.
    pub fn plain_secret(&self) -> MailVaultResult<String> {
        decrypt!(&self.secret)
    }

    /// Updates connection fields after re-proving them: when host, port or
    /// secret change, a live connection test runs against the edited
    /// configuration before anything is persisted.
    pub async fn update_validated(
        account_id: u64,
        host: Option<String>,
        port: Option<Option<u16>>,
        secret: Option<String>,
        timeout_secs: Option<u64>,
        allow_insecure_tls: Option<bool>,
    ) -> MailVaultResult<Account> {
        let current = Self::get(account_id).await?;
        let connection_dirty = host.is_some() || port.is_some() || secret.is_some();
        if connection_dirty {
            let mut candidate = current.clone();
            if let Some(host) = &host {
                candidate.host = host.clone();
            }
            if let Some(port) = port {
                candidate.port = port;
            }
            if let Some(secret) = &secret {
                candidate.secret = encrypt!(secret)?;
            }
            if let Some(timeout) = timeout_secs {
                candidate.timeout_secs = timeout;
            }
            if let Some(allow) = allow_insecure_tls {
                candidate.allow_insecure_tls = allow;
            }
            crate::modules::fetcher::test_account(&candidate).await?;
        }
        Self::update_connection_fields(
            account_id,
            host,
            port,
            secret,
            timeout_secs,
            allow_insecure_tls,
        )
        .await
    }

    /// Updates mutable account fields without a live test. The protocol is
    /// immutable; changing it means re-creating the account.
    pub async fn update_connection_fields(
        account_id: u64,
        host: Option<String>,
        port: Option<Option<u16>>,
        secret: Option<String>,
        timeout_secs: Option<u64>,
        allow_insecure_tls: Option<bool>,
    ) -> MailVaultResult<Account> {
        let encrypted = match secret {
            Some(plain) => Some(encrypt!(&plain)?),
            None => None,
        };
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Account>(account_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Account with ID '{account_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                if let Some(host) = host {
                    updated.host = host;
                }
                if let Some(port) = port {
                    updated.port = port;
                }
                if let Some(secret) = encrypted {
                    updated.secret = secret;
                }
                if let Some(timeout) = timeout_secs {
                    updated.timeout_secs = timeout;
                }
                if let Some(allow) = allow_insecure_tls {
                    updated.allow_insecure_tls = allow;
                }
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(account_id).await
    }

    /// Sets the health flag; returns the entity only when the flag actually
    /// transitioned, so downstream effects fire exactly once.
    pub async fn set_health(
        account_id: u64,
        health: Health,
        last_error: Option<String>,
    ) -> MailVaultResult<bool> {
        let previous = update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Account>(account_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Account with ID '{account_id}' not found"),
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

    /// Deletes the account and, by ownership, all of its mailboxes with
    /// their emails and routines.
    pub async fn delete(account_id: u64) -> MailVaultResult<()> {
        let mailboxes = Mailbox::list_for_account(account_id).await?;
        for mailbox in mailboxes {
            Mailbox::delete(mailbox.id).await?;
        }
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<Account>(account_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Account '{}' not found during deletion.", account_id),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await?;
        info!("Deleted account {}", account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_account_rejects_duplicate_identity() {
        let request = AccountCreateRequest {
            owner_id: 71,
            email: "dup@example.test".into(),
            secret: "pw".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        };
        Account::create(request.clone()).await.unwrap();
        let err = Account::create(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn test_same_address_different_protocol_is_allowed() {
        let mut request = AccountCreateRequest {
            owner_id: 72,
            email: "both@example.test".into(),
            secret: "pw".into(),
            host: "mail.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        };
        Account::create(request.clone()).await.unwrap();
        request.protocol = MailProtocol::Pop3Tls;
        Account::create(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_secret_round_trips_through_encryption() {
        let account = Account::create(AccountCreateRequest {
            owner_id: 73,
            email: "secret@example.test".into(),
            secret: "hunter2".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::Imap,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_ne!(account.secret, "hunter2");
        assert_eq!(account.plain_secret().unwrap(), "hunter2");
    }

    #[test]
    fn test_uses_tls_matches_transport_per_protocol() {
        assert!(!MailProtocol::Imap.uses_tls());
        assert!(!MailProtocol::Pop3.uses_tls());
        assert!(MailProtocol::ImapTls.uses_tls());
        assert!(MailProtocol::Pop3Tls.uses_tls());
        assert!(MailProtocol::Jmap.uses_tls());
        // Exchange runs on the IMAP-over-TLS path (default port 993).
        assert!(MailProtocol::Exchange.uses_tls());
    }

    #[test]
    fn test_effective_port_falls_back_to_protocol_default() {
        let mut account = Account::default();
        account.protocol = MailProtocol::Pop3Tls;
        assert_eq!(account.effective_port(), 995);
        account.port = Some(2995);
        assert_eq!(account.effective_port(), 2995);
    }
}
