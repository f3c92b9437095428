use crate::modules::account::entity::Account;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::open_fetcher;
use crate::modules::health::Health;
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};
use crate::modules::settings::cli::SETTINGS;
use tracing::{debug, info};

/// Scans the remote account and mirrors its folder list into the archive.
///
/// Known folders are healed and their role refreshed; new folders are
/// created with the configured default flags. Folders matching the ignore
/// regex are skipped, as are junk folders while spam is being thrown out.
pub async fn scan_account(account_id: u64) -> MailVaultResult<Vec<Mailbox>> {
    let account = Account::get(account_id).await?;
    info!("Scanning mailboxes of account '{}'", account.email);

    let mut fetcher = open_fetcher(&account).await?;
    let listing = fetcher.list_mailboxes().await;
    fetcher.close().await;
    let listing = listing?;

    let mut mailboxes = Vec::with_capacity(listing.len());
    for (name, kind) in listing {
        if let Some(mailbox) = register_scanned_mailbox(&account, &name, kind).await? {
            mailboxes.push(mailbox);
        }
    }
    info!(
        "Scan of '{}' registered {} mailboxes",
        account.email,
        mailboxes.len()
    );
    Ok(mailboxes)
}

/// Creates or refreshes one scanned mailbox. Returns `None` when the folder
/// is skipped.
pub async fn register_scanned_mailbox(
    account: &Account,
    name: &str,
    kind: MailboxKind,
) -> MailVaultResult<Option<Mailbox>> {
    if SETTINGS.mailvault_throw_out_spam && kind == MailboxKind::Junk {
        debug!("'{}' is a spambox, it is skipped.", name);
        return Ok(None);
    }
    if Mailbox::is_ignored(name) {
        return Ok(None);
    }

    if let Some(existing) = Mailbox::find_by_name(account.id, name).await? {
        // The server may have reclassified the folder since it was first
        // recorded.
        if existing.kind != kind {
            Mailbox::set_kind(existing.id, kind).await?;
        }
        // Re-scanned folders are proven reachable again.
        Mailbox::set_health(existing.id, Health::Healthy, None).await?;
        debug!("'{}' already exists in db, it has been set to healthy.", name);
        return Ok(Some(Mailbox::get(existing.id).await?));
    }

    let mailbox = Mailbox::new(account.id, name, kind);
    mailbox.save().await?;
    debug!("Successfully saved mailbox '{}' to db.", name);
    Ok(Some(mailbox))
}

/// Live test of one mailbox: connect, no-op, open read-only. Health flags
/// are set from the outcome — mailbox-level failures downgrade the mailbox,
/// account-level failures downgrade the account and cascade.
pub async fn test_mailbox(mailbox_id: u64) -> MailVaultResult<()> {
    let mailbox = Mailbox::get(mailbox_id).await?;
    let account = Account::get(mailbox.account_id).await?;
    info!("Testing mailbox '{}' of '{}' ...", mailbox.name, account.email);

    let connected = open_fetcher(&account).await;
    let result = match connected {
        Ok(mut fetcher) => {
            let outcome = fetcher.test(Some(&mailbox)).await;
            fetcher.close().await;
            outcome
        }
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => {
            Mailbox::set_health(mailbox.id, Health::Healthy, None).await?;
            Account::set_health(account.id, Health::Healthy, None).await?;
            info!("Successfully tested mailbox '{}'", mailbox.name);
            Ok(())
        }
        Err(error) => {
            info!(
                "Failed testing mailbox '{}' with error: {}",
                mailbox.name,
                error.message()
            );
            if error.code().is_account_level() {
                crate::modules::health::mark_account_unhealthy(account.id, error.message())
                    .await?;
            } else {
                Mailbox::set_health(
                    mailbox.id,
                    Health::Unhealthy,
                    Some(error.message().to_string()),
                )
                .await?;
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::account::entity::{AccountCreateRequest, MailProtocol};

    async fn test_account(owner_id: u64, email: &str) -> Account {
        Account::create(AccountCreateRequest {
            owner_id,
            email: email.into(),
            secret: "pw".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_scanned_mailbox_creates_then_heals() {
        let account = test_account(81, "scan@example.test").await;
        let created = register_scanned_mailbox(&account, "INBOX", MailboxKind::Inbox)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.health, Health::Healthy);

        Mailbox::set_health(created.id, Health::Unhealthy, Some("boom".into()))
            .await
            .unwrap();
        let healed = register_scanned_mailbox(&account, "INBOX", MailboxKind::Inbox)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healed.id, created.id);
        assert_eq!(healed.health, Health::Healthy);
    }

    #[tokio::test]
    async fn test_rescan_refreshes_reclassified_folder_role() {
        let account = test_account(82, "rescan-kind@example.test").await;
        let created = register_scanned_mailbox(&account, "Archive", MailboxKind::Custom)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.kind, MailboxKind::Custom);

        // The server now reports the folder with a special-use attribute.
        let refreshed = register_scanned_mailbox(&account, "Archive", MailboxKind::Archive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.id, created.id);
        assert_eq!(refreshed.kind, MailboxKind::Archive);
    }
}
