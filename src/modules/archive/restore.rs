use crate::modules::account::entity::Account;
use crate::modules::archive::email::Email;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::open_fetcher;
use crate::modules::mailbox::entity::Mailbox;
use tracing::info;

/// Pushes an archived message back to the remote server by appending its
/// stored .eml to the email's owning mailbox. Runs on the caller's context,
/// outside the scheduler.
///
/// Fails with `FileNotFound` when the archive holds no .eml blob for the
/// message (the mailbox was configured with save_to_eml off).
pub async fn restore_email(email_id: u64) -> MailVaultResult<()> {
    let email = Email::get(email_id).await?;
    let raw = email.stored_eml_bytes().await?;
    let mailbox = Mailbox::get(email.mailbox_id).await?;
    let account = Account::get(mailbox.account_id).await?;

    info!(
        "Restoring message {} to '{}' on {}",
        email.message_id, mailbox.name, account.host
    );
    let mut fetcher = open_fetcher(&account).await?;
    let result = fetcher.append(&mailbox, &raw).await;
    fetcher.close().await;
    result?;
    info!("Successfully restored message {}", email.message_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::account::entity::{AccountCreateRequest, MailProtocol};
    use crate::modules::archive::writer::{archive_email, ArchiveOutcome};
    use crate::modules::error::code::ErrorCode;
    use crate::modules::mailbox::entity::MailboxKind;
    use crate::modules::message::parser::parse_email;

    #[tokio::test]
    async fn test_restore_without_stored_eml_is_file_not_found() {
        let account = Account::create(AccountCreateRequest {
            owner_id: 41,
            email: "restore@example.test".into(),
            secret: "pw".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        })
        .await
        .unwrap();
        let mailbox = Mailbox::new(account.id, "INBOX", MailboxKind::Inbox);
        mailbox.save().await.unwrap();
        let mailbox = Mailbox::set_flags(mailbox.id, Some(false), None, None)
            .await
            .unwrap();

        let raw = b"Message-ID: <norestore@e.test>\r\nFrom: a@x.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\r\nx\r\n";
        let parsed = parse_email(raw).unwrap();
        let ArchiveOutcome::Archived(email_id) =
            archive_email(&mailbox, &parsed, raw).await.unwrap()
        else {
            panic!("expected Archived");
        };

        let error = restore_email(email_id).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::FileNotFound);
    }
}
