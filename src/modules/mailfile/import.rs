use crate::modules::archive::writer::{archive_email, ArchiveOutcome};
use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::modules::mailbox::entity::Mailbox;
use crate::modules::mailfile::flat::{split_babyl, split_mbox, split_mmdf};
use crate::modules::mailfile::format::FileFormat;
use crate::modules::mailfile::tree::{extract_zip, read_maildir, read_mh, zip_entries};
use crate::modules::message::parser::parse_email;
use crate::raise_error;
use std::path::Path;
use tracing::{info, warn};

/// Outcome counts of one import. A corrupt container fails the request; a
/// corrupt member inside a valid container only bumps `failed`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub discarded_spam: usize,
    pub failed: usize,
}

/// Feeds every message contained in an uploaded mailbox file through the
/// parsing and archiving pipeline against the target mailbox.
pub async fn import_file(
    mailbox: &Mailbox,
    data: &[u8],
    format: FileFormat,
) -> MailVaultResult<ImportReport> {
    info!(
        "Adding emails from {} file to mailbox '{}'",
        format, mailbox.name
    );
    let mut report = ImportReport::default();
    match format {
        FileFormat::Eml => {
            // A single message is its own container: parse failures fail
            // the request.
            let parsed = parse_email(data)?;
            record(&mut report, archive_email(mailbox, &parsed, data).await?);
        }
        FileFormat::ZipEml => {
            for (name, raw) in zip_entries(data)? {
                import_member(mailbox, &raw, &name, &mut report).await?;
            }
        }
        FileFormat::Mbox => {
            for (index, raw) in split_mbox(data)?.iter().enumerate() {
                import_member(mailbox, raw, &format!("message #{}", index + 1), &mut report)
                    .await?;
            }
        }
        FileFormat::Mmdf => {
            for (index, raw) in split_mmdf(data)?.iter().enumerate() {
                import_member(mailbox, raw, &format!("message #{}", index + 1), &mut report)
                    .await?;
            }
        }
        FileFormat::Babyl => {
            for (index, member) in split_babyl(data)?.iter().enumerate() {
                match member {
                    Some(raw) => {
                        import_member(
                            mailbox,
                            raw,
                            &format!("message #{}", index + 1),
                            &mut report,
                        )
                        .await?
                    }
                    None => {
                        warn!("Skipping malformed babyl message #{}", index + 1);
                        report.failed += 1;
                    }
                }
            }
        }
        FileFormat::Maildir | FileFormat::ZipMaildir => {
            let tempdir = tempfile::tempdir()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            extract_zip(data, tempdir.path())?;
            let messages = read_trees(tempdir.path(), read_maildir)?;
            for (index, raw) in messages.iter().enumerate() {
                import_member(mailbox, raw, &format!("message #{}", index + 1), &mut report)
                    .await?;
            }
        }
        FileFormat::Mh | FileFormat::ZipMh => {
            let tempdir = tempfile::tempdir()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            extract_zip(data, tempdir.path())?;
            let messages = read_trees(tempdir.path(), read_mh)?;
            for (index, raw) in messages.iter().enumerate() {
                import_member(mailbox, raw, &format!("message #{}", index + 1), &mut report)
                    .await?;
            }
        }
    }
    info!(
        "Successfully added emails from file: {} imported, {} duplicates, {} discarded, {} failed",
        report.imported, report.duplicates, report.discarded_spam, report.failed
    );
    Ok(report)
}

/// The extracted zip either is the tree itself or holds one tree per
/// subdirectory.
fn read_trees(
    root: &Path,
    read_tree: fn(&Path) -> MailVaultResult<Vec<Vec<u8>>>,
) -> MailVaultResult<Vec<Vec<u8>>> {
    if let Ok(messages) = read_tree(root) {
        return Ok(messages);
    }
    let mut messages = Vec::new();
    let mut found_any = false;
    let mut subdirs: Vec<_> = std::fs::read_dir(root)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    for subdir in subdirs {
        if let Ok(tree_messages) = read_tree(&subdir) {
            found_any = true;
            messages.extend(tree_messages);
        }
    }
    if !found_any {
        return Err(raise_error!(
            "The given file does not contain a valid mailbox directory tree.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    Ok(messages)
}

/// Best-effort import of one member: parse failures are logged and counted,
/// archive failures (storage, database) still abort the import.
async fn import_member(
    mailbox: &Mailbox,
    raw: &[u8],
    member: &str,
    report: &mut ImportReport,
) -> MailVaultResult<()> {
    let parsed = match parse_email(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!("Skipping unparsable {}: {}", member, error.message());
            report.failed += 1;
            return Ok(());
        }
    };
    record(report, archive_email(mailbox, &parsed, raw).await?);
    Ok(())
}

fn record(report: &mut ImportReport, outcome: ArchiveOutcome) {
    match outcome {
        ArchiveOutcome::Archived(_) => report.imported += 1,
        ArchiveOutcome::Duplicate(_) => report.duplicates += 1,
        ArchiveOutcome::DiscardedSpam => report.discarded_spam += 1,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::account::entity::{Account, AccountCreateRequest, MailProtocol};
    use crate::modules::archive::email::Email;
    use crate::modules::mailbox::entity::MailboxKind;
    use crate::modules::mailfile::flat::write_mbox;

    pub(crate) async fn import_fixture(owner_id: u64, email: &str) -> Mailbox {
        let account = Account::create(AccountCreateRequest {
            owner_id,
            email: email.into(),
            secret: "pw".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        })
        .await
        .unwrap();
        let mailbox = Mailbox::new(account.id, "INBOX", MailboxKind::Inbox);
        mailbox.save().await.unwrap();
        mailbox
    }

    pub(crate) fn sample_message(id: &str) -> Vec<u8> {
        format!(
            "Message-ID: <{id}@e.test>\nSubject: msg {id}\nFrom: a@x.test\nTo: u@e.test\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\n\nbody {id}\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_import_mbox_archives_every_member() {
        let mailbox = import_fixture(51, "mbox@example.test").await;
        let file = write_mbox(&[
            sample_message("i1"),
            sample_message("i2"),
            sample_message("i3"),
        ]);
        let report = import_file(&mailbox, &file, FileFormat::Mbox).await.unwrap();
        assert_eq!(report.imported, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(Email::list_for_mailbox(mailbox.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_import_is_idempotent_across_runs() {
        let mailbox = import_fixture(52, "again@example.test").await;
        let file = write_mbox(&[sample_message("r1"), sample_message("r2")]);
        let first = import_file(&mailbox, &file, FileFormat::Mbox).await.unwrap();
        assert_eq!(first.imported, 2);
        let second = import_file(&mailbox, &file, FileFormat::Mbox).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(Email::list_for_mailbox(mailbox.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_corrupt_container_fails() {
        let mailbox = import_fixture(53, "corrupt@example.test").await;
        let result = import_file(&mailbox, b"this is not an mbox", FileFormat::Mbox).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_import_unknown_zip_payload_fails() {
        let mailbox = import_fixture(54, "zipbad@example.test").await;
        let result = import_file(&mailbox, b"not a zip", FileFormat::ZipEml).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_import_single_eml() {
        let mailbox = import_fixture(55, "single@example.test").await;
        let report = import_file(&mailbox, &sample_message("solo"), FileFormat::Eml)
            .await
            .unwrap();
        assert_eq!(report.imported, 1);
    }
}
