use crate::id;
use crate::modules::account::entity::Account;
use crate::modules::archive::attachment::Attachment;
use crate::modules::archive::blob;
use crate::modules::archive::correspondent::{Correspondent, EmailCorrespondent};
use crate::modules::archive::email::{email_dedup_key, Email};
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::transactional_impl;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};
use crate::modules::message::parser::ParsedEmail;
use crate::modules::settings::cli::SETTINGS;
use crate::{raise_error, utc_now};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of one archive write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArchiveOutcome {
    /// Newly archived; carries the Email id.
    Archived(u64),
    /// A row with this (mailbox, message-id) already existed. Not an error.
    Duplicate(u64),
    /// Thrown out by the junk-filter policy.
    DiscardedSpam,
}

// Advisory lock per (mailbox, message-id): concurrent fetchers racing on
// the same message serialize here instead of burning an insert conflict.
static WRITE_LOCKS: LazyLock<DashMap<String, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

const DB_RETRY_ATTEMPTS: u32 = 3;

/// Idempotently persists one parsed message into the target mailbox.
///
/// The Email row, its attachments and its correspondent edges commit in a
/// single transaction. Blob writes happen first; a blob failure fails the
/// whole write and nothing is committed.
pub async fn archive_email(
    mailbox: &Mailbox,
    parsed: &ParsedEmail,
    raw: &[u8],
) -> MailVaultResult<ArchiveOutcome> {
    let lock_key = email_dedup_key(mailbox.id, &parsed.message_id);
    let lock = WRITE_LOCKS
        .entry(lock_key.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = lock.lock().await;

    if let Some(existing) = Email::find_duplicate(mailbox.id, &parsed.message_id).await? {
        debug!(
            "Message {} already archived in mailbox '{}'",
            parsed.message_id, mailbox.name
        );
        return Ok(ArchiveOutcome::Duplicate(existing.id));
    }

    if discards_as_spam(
        SETTINGS.mailvault_throw_out_spam,
        parsed.is_spam,
        mailbox.kind,
    ) {
        debug!(
            "Message {} is flagged as spam and is thrown out",
            parsed.message_id
        );
        return Ok(ArchiveOutcome::DiscardedSpam);
    }

    let account = Account::get(mailbox.account_id).await?;
    let owner_id = account.owner_id;
    let email_id = id!(64);

    let eml_path = if mailbox.save_to_eml {
        let relative = blob::eml_relative_path(mailbox.id, email_id, &parsed.message_id);
        blob::write_blob(&relative, raw).await?;
        Some(relative)
    } else {
        None
    };

    // Correspondents are owner-level shared rows; the upsert is idempotent
    // and safe to run outside the email transaction.
    let mut edges: Vec<EmailCorrespondent> = Vec::new();
    let mut seen_edges: HashSet<String> = HashSet::new();
    for sighting in &parsed.correspondents {
        let correspondent = Correspondent::upsert(
            owner_id,
            &sighting.address,
            sighting.display_name.clone(),
            parsed.list_serv.clone(),
        )
        .await?;
        let edge = EmailCorrespondent::new(email_id, correspondent.id, sighting.mention);
        if seen_edges.insert(edge.edge_key.clone()) {
            edges.push(edge);
        }
    }

    let (reply_to, references) = resolve_reference_edges(owner_id, parsed).await?;

    let mut attachments = Vec::with_capacity(parsed.attachments.len());
    let mut written_blobs: Vec<String> = eml_path.iter().cloned().collect();
    for parsed_attachment in &parsed.attachments {
        let attachment_id = id!(64);
        let file_path = if mailbox.save_attachments {
            let relative = blob::attachment_relative_path(
                mailbox.id,
                email_id,
                attachment_id,
                &parsed_attachment.file_name,
            );
            blob::write_blob(&relative, &parsed_attachment.data).await?;
            written_blobs.push(relative.clone());
            Some(relative)
        } else {
            None
        };
        attachments.push(Attachment {
            id: attachment_id,
            email_id,
            file_name: parsed_attachment.file_name.clone(),
            content_maintype: parsed_attachment.content_maintype.clone(),
            content_subtype: parsed_attachment.content_subtype.clone(),
            content_disposition: parsed_attachment.content_disposition.clone(),
            content_id: parsed_attachment.content_id.clone(),
            datasize: parsed_attachment.data.len() as u64,
            file_path,
            favorite: false,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        });
    }

    let email = Email {
        id: email_id,
        mailbox_id: mailbox.id,
        dedup_key: lock_key,
        message_id: parsed.message_id.clone(),
        subject: parsed.subject.clone(),
        sent_at: parsed.sent_at,
        plain_body: parsed.plain_body.clone(),
        html_body: parsed.html_body.clone(),
        headers: parsed.headers.clone(),
        is_spam: parsed.is_spam,
        datasize: parsed.datasize,
        eml_path,
        reply_to,
        references,
        favorite: false,
        created_at: utc_now!(),
        updated_at: utc_now!(),
    };

    match commit_with_retry(email, attachments, edges).await {
        Ok(()) => {
            info!(
                "Archived message {} into mailbox '{}'",
                parsed.message_id, mailbox.name
            );
            Ok(ArchiveOutcome::Archived(email_id))
        }
        Err(error) => {
            // Leave no orphaned blobs behind a failed transaction.
            for relative in &written_blobs {
                blob::remove_blob(relative).await;
            }
            // A lost race on the unique key is a duplicate, not a failure.
            if let Some(existing) = Email::find_duplicate(mailbox.id, &parsed.message_id).await? {
                return Ok(ArchiveOutcome::Duplicate(existing.id));
            }
            Err(error)
        }
    }
}

/// The junk-filter policy. A junk mailbox never discards: the user
/// explicitly archived a spam folder.
fn discards_as_spam(throw_out_spam: bool, is_spam: bool, kind: MailboxKind) -> bool {
    throw_out_spam && is_spam && kind != MailboxKind::Junk
}

/// Resolves References / In-Reply-To message-ids against archived emails of
/// the same owner. Missing targets are fine; the relation is sparse.
async fn resolve_reference_edges(
    owner_id: u64,
    parsed: &ParsedEmail,
) -> MailVaultResult<(Vec<u64>, Vec<u64>)> {
    let reply_to = resolve_owned_emails(owner_id, &parsed.in_reply_to).await?;
    let references = resolve_owned_emails(owner_id, &parsed.references).await?;
    Ok((reply_to, references))
}

async fn resolve_owned_emails(
    owner_id: u64,
    message_ids: &[String],
) -> MailVaultResult<Vec<u64>> {
    let mut resolved = Vec::new();
    for message_id in message_ids {
        for email in Email::list_by_message_id(message_id).await? {
            let Some(mailbox) = Mailbox::find(email.mailbox_id).await? else {
                continue;
            };
            let Some(account) = Account::find(mailbox.account_id).await? else {
                continue;
            };
            if account.owner_id == owner_id && !resolved.contains(&email.id) {
                resolved.push(email.id);
            }
        }
    }
    Ok(resolved)
}

async fn commit_with_retry(
    email: Email,
    attachments: Vec<Attachment>,
    edges: Vec<EmailCorrespondent>,
) -> MailVaultResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let email = email.clone();
        let attachments = attachments.clone();
        let edges = edges.clone();
        let result = transactional_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.insert(email)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            for attachment in attachments {
                rw.insert(attachment)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }
            for edge in edges {
                rw.insert(edge)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(()) => return Ok(()),
            Err(error) if attempt < DB_RETRY_ATTEMPTS => {
                debug!(
                    "Archive commit attempt {} failed, retrying: {}",
                    attempt,
                    error.message()
                );
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::account::entity::{AccountCreateRequest, MailProtocol};
    use crate::modules::message::parser::parse_email;

    async fn fixture(owner_id: u64, email: &str, kind: MailboxKind) -> Mailbox {
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
        let mailbox = Mailbox::new(account.id, "INBOX", kind);
        mailbox.save().await.unwrap();
        mailbox
    }

    fn sample_raw(message_id: &str) -> Vec<u8> {
        format!(
            "Message-ID: {message_id}\r\n\
Subject: Hello\r\n\
From: a@x.test\r\n\
To: u@e.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
\r\n\
body\r\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_archive_creates_email_correspondents_and_edges() {
        let mailbox = fixture(31, "happy@example.test", MailboxKind::Inbox).await;
        let raw = sample_raw("<s1@e.test>");
        let parsed = parse_email(&raw).unwrap();

        let outcome = archive_email(&mailbox, &parsed, &raw).await.unwrap();
        let ArchiveOutcome::Archived(email_id) = outcome else {
            panic!("expected Archived, got {:?}", outcome);
        };

        let email = Email::get(email_id).await.unwrap();
        assert_eq!(email.message_id, "<s1@e.test>");
        assert_eq!(email.subject, "Hello");
        assert!(email.eml_path.is_some());

        let edges = EmailCorrespondent::list_for_email(email_id).await.unwrap();
        assert_eq!(edges.len(), 2);
        let correspondents = Correspondent::list_for_owner(31).await.unwrap();
        let addresses: Vec<_> = correspondents.iter().map(|c| c.address.as_str()).collect();
        assert!(addresses.contains(&"a@x.test"));
        assert!(addresses.contains(&"u@e.test"));
    }

    #[tokio::test]
    async fn test_archiving_twice_is_idempotent() {
        let mailbox = fixture(32, "dup@example.test", MailboxKind::Inbox).await;
        let raw = sample_raw("<s4@e.test>");
        let parsed = parse_email(&raw).unwrap();

        let first = archive_email(&mailbox, &parsed, &raw).await.unwrap();
        let ArchiveOutcome::Archived(email_id) = first else {
            panic!("expected Archived");
        };
        let second = archive_email(&mailbox, &parsed, &raw).await.unwrap();
        assert_eq!(second, ArchiveOutcome::Duplicate(email_id));

        assert_eq!(Email::list_for_mailbox(mailbox.id).await.unwrap().len(), 1);
        let edges = EmailCorrespondent::list_for_email(email_id).await.unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn test_reference_edges_stay_within_owner() {
        let mailbox_a = fixture(33, "edges-a@example.test", MailboxKind::Inbox).await;
        let mailbox_b = fixture(34, "edges-b@example.test", MailboxKind::Inbox).await;

        // The same parent message-id archived for two different owners.
        let parent_raw = sample_raw("<parent-x@e.test>");
        let parent_parsed = parse_email(&parent_raw).unwrap();
        let ArchiveOutcome::Archived(parent_a) =
            archive_email(&mailbox_a, &parent_parsed, &parent_raw).await.unwrap()
        else {
            panic!("expected Archived");
        };
        archive_email(&mailbox_b, &parent_parsed, &parent_raw)
            .await
            .unwrap();

        let child_raw = format!(
            "Message-ID: <child-x@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 11:00:00 +0000\r\n\
In-Reply-To: <parent-x@e.test>\r\n\
References: <parent-x@e.test>\r\n\
\r\n\
re\r\n"
        )
        .into_bytes();
        let child_parsed = parse_email(&child_raw).unwrap();
        let ArchiveOutcome::Archived(child_id) =
            archive_email(&mailbox_a, &child_parsed, &child_raw).await.unwrap()
        else {
            panic!("expected Archived");
        };

        let child = Email::get(child_id).await.unwrap();
        // Only owner 33's copy of the parent is linked.
        assert_eq!(child.reply_to, vec![parent_a]);
        assert_eq!(child.references, vec![parent_a]);
    }

    #[tokio::test]
    async fn test_missing_reference_targets_do_not_fail() {
        let mailbox = fixture(35, "sparse@example.test", MailboxKind::Inbox).await;
        let raw = format!(
            "Message-ID: <orphan@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 11:00:00 +0000\r\n\
References: <never-archived@e.test>\r\n\
\r\n\
re\r\n"
        )
        .into_bytes();
        let parsed = parse_email(&raw).unwrap();
        let ArchiveOutcome::Archived(email_id) =
            archive_email(&mailbox, &parsed, &raw).await.unwrap()
        else {
            panic!("expected Archived");
        };
        assert!(Email::get(email_id).await.unwrap().references.is_empty());
    }

    #[test]
    fn test_spam_policy_discards_outside_junk_only() {
        // THROW_OUT_SPAM on: spam is dropped everywhere except junk boxes.
        assert!(discards_as_spam(true, true, MailboxKind::Inbox));
        assert!(!discards_as_spam(true, true, MailboxKind::Junk));
        // Policy off or message not spam: nothing is dropped.
        assert!(!discards_as_spam(false, true, MailboxKind::Inbox));
        assert!(!discards_as_spam(true, false, MailboxKind::Inbox));
    }

    #[tokio::test]
    async fn test_eml_blob_skipped_when_mailbox_opts_out() {
        let mailbox = fixture(36, "noeml@example.test", MailboxKind::Inbox).await;
        let mailbox = Mailbox::set_flags(mailbox.id, Some(false), Some(false), None)
            .await
            .unwrap();
        let raw = sample_raw("<noblob@e.test>");
        let parsed = parse_email(&raw).unwrap();
        let ArchiveOutcome::Archived(email_id) =
            archive_email(&mailbox, &parsed, &raw).await.unwrap()
        else {
            panic!("expected Archived");
        };
        let email = Email::get(email_id).await.unwrap();
        assert!(email.eml_path.is_none());
        assert!(email.stored_eml_bytes().await.is_err());
    }
}
