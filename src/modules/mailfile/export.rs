use crate::base64_encode;
use crate::modules::archive::attachment::Attachment;
use crate::modules::archive::email::Email;
use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::modules::mailbox::entity::Mailbox;
use crate::modules::mailfile::flat::{write_babyl, write_mbox, write_mmdf};
use crate::modules::mailfile::format::FileFormat;
use crate::modules::mailfile::tree::{write_maildir, write_mh, zip_directory};
use crate::modules::utils::sanitize_file_name;
use crate::raise_error;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

// Headers the re-serializer owns; stored values would conflict with the
// MIME structure it writes.
const STRUCTURAL_HEADERS: &[&str] = &["content-type", "content-transfer-encoding", "mime-version"];

/// Raw .eml bytes of one archived email: the stored blob when the mailbox
/// kept it, otherwise a re-serialization of the archived headers, bodies
/// and attachments.
pub async fn reconstitute_eml(email: &Email) -> MailVaultResult<Vec<u8>> {
    if email.eml_path.is_some() {
        if let Ok(raw) = email.stored_eml_bytes().await {
            return Ok(raw);
        }
        warn!(
            "Stored .eml for email {} is missing, re-serializing from the archive",
            email.id
        );
    }
    let attachments = Attachment::list_for_email(email.id).await?;
    Ok(serialize_email(email, &attachments).await)
}

async fn serialize_email(email: &Email, attachments: &[Attachment]) -> Vec<u8> {
    let mut out = Vec::with_capacity(email.datasize as usize);
    for (name, value) in &email.headers {
        if STRUCTURAL_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"MIME-Version: 1.0\r\n");

    let has_html = !email.html_body.is_empty();
    let mut parts: Vec<(String, Vec<u8>)> = Vec::new();
    for attachment in attachments {
        match attachment.stored_bytes().await {
            Ok(data) => {
                let mut part = Vec::new();
                part.extend_from_slice(
                    format!(
                        "Content-Type: {}; name=\"{}\"\r\n",
                        attachment.content_type(),
                        attachment.file_name
                    )
                    .as_bytes(),
                );
                part.extend_from_slice(
                    format!(
                        "Content-Disposition: {}; filename=\"{}\"\r\n",
                        attachment
                            .content_disposition
                            .as_deref()
                            .unwrap_or("attachment"),
                        attachment.file_name
                    )
                    .as_bytes(),
                );
                if let Some(content_id) = &attachment.content_id {
                    part.extend_from_slice(format!("Content-ID: {}\r\n", content_id).as_bytes());
                }
                part.extend_from_slice(b"Content-Transfer-Encoding: base64\r\n\r\n");
                part.extend_from_slice(base64_encode!(&data).as_bytes());
                part.extend_from_slice(b"\r\n");
                parts.push((attachment.file_name.clone(), part));
            }
            Err(_) => {
                // No payload in blob storage; the row alone cannot be
                // exported.
                debug!(
                    "Attachment {} has no stored payload, skipped in export",
                    attachment.id
                );
            }
        }
    }

    if parts.is_empty() && !has_html {
        out.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.extend_from_slice(email.plain_body.as_bytes());
        out.extend_from_slice(b"\r\n");
        return out;
    }

    let mixed_boundary = format!("mailvault-mixed-{:016x}", email.id);
    let alternative_boundary = format!("mailvault-alt-{:016x}", email.id);
    out.extend_from_slice(
        format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
            mixed_boundary
        )
        .as_bytes(),
    );

    out.extend_from_slice(format!("--{}\r\n", mixed_boundary).as_bytes());
    if has_html {
        out.extend_from_slice(
            format!(
                "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n",
                alternative_boundary
            )
            .as_bytes(),
        );
        out.extend_from_slice(format!("--{}\r\n", alternative_boundary).as_bytes());
        out.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.extend_from_slice(email.plain_body.as_bytes());
        out.extend_from_slice(format!("\r\n--{}\r\n", alternative_boundary).as_bytes());
        out.extend_from_slice(b"Content-Type: text/html; charset=utf-8\r\n\r\n");
        out.extend_from_slice(email.html_body.as_bytes());
        out.extend_from_slice(format!("\r\n--{}--\r\n", alternative_boundary).as_bytes());
    } else {
        out.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.extend_from_slice(email.plain_body.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (_, part) in &parts {
        out.extend_from_slice(format!("--{}\r\n", mixed_boundary).as_bytes());
        out.extend_from_slice(part);
    }
    out.extend_from_slice(format!("--{}--\r\n", mixed_boundary).as_bytes());
    out
}

/// Streams a set of archived emails into one container file of the
/// requested format. The returned temp file is deleted when dropped, on
/// every exit path.
pub async fn export_emails(
    emails: &[Email],
    format: FileFormat,
) -> MailVaultResult<NamedTempFile> {
    if emails.is_empty() {
        return Err(raise_error!(
            "There are no emails to export.".into(),
            ErrorCode::ResourceNotFound
        ));
    }
    let mut raws = Vec::with_capacity(emails.len());
    for email in emails {
        raws.push(reconstitute_eml(email).await?);
    }
    let bytes = container_bytes(emails, &raws, format)?;
    write_tempfile(&bytes)
}

/// In-memory container of the given format.
fn container_bytes(
    emails: &[Email],
    raws: &[Vec<u8>],
    format: FileFormat,
) -> MailVaultResult<Vec<u8>> {
    let bytes = match format {
        FileFormat::Eml if raws.len() == 1 => raws[0].clone(),
        // Several .eml files only travel as a zip.
        FileFormat::Eml | FileFormat::ZipEml => {
            let mut buffer = std::io::Cursor::new(Vec::new());
            let mut zip_writer = zip::ZipWriter::new(&mut buffer);
            let options: zip::write::SimpleFileOptions = Default::default();
            for (email, raw) in emails.iter().zip(raws) {
                let name = format!(
                    "{}_{}.eml",
                    email.id,
                    sanitize_file_name(&email.message_id)
                );
                zip_writer
                    .start_file(name, options)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                zip_writer
                    .write_all(raw)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }
            zip_writer
                .finish()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            buffer.into_inner()
        }
        FileFormat::Mbox => write_mbox(raws),
        FileFormat::Mmdf => write_mmdf(raws),
        FileFormat::Babyl => write_babyl(raws),
        FileFormat::Maildir | FileFormat::ZipMaildir => {
            let tree = tempfile::tempdir()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            write_maildir(tree.path(), raws)?;
            let mut buffer = std::io::Cursor::new(Vec::new());
            zip_directory(tree.path(), &mut buffer)?;
            buffer.into_inner()
        }
        FileFormat::Mh | FileFormat::ZipMh => {
            let tree = tempfile::tempdir()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            write_mh(tree.path(), raws)?;
            let mut buffer = std::io::Cursor::new(Vec::new());
            zip_directory(tree.path(), &mut buffer)?;
            buffer.into_inner()
        }
    };
    Ok(bytes)
}

/// Wraps each mailbox's messages in its own container, then zips the
/// per-mailbox files together. Mailboxes without emails are skipped.
pub async fn export_mailboxes(
    mailboxes: &[Mailbox],
    format: FileFormat,
) -> MailVaultResult<NamedTempFile> {
    if mailboxes.is_empty() {
        return Err(raise_error!(
            "There are no mailboxes to export.".into(),
            ErrorCode::ResourceNotFound
        ));
    }
    let mut buffer = std::io::Cursor::new(Vec::new());
    let mut zip_writer = zip::ZipWriter::new(&mut buffer);
    let options: zip::write::SimpleFileOptions = Default::default();
    let mut exported_any = false;
    for mailbox in mailboxes {
        let emails = Email::list_for_mailbox(mailbox.id).await?;
        if emails.is_empty() {
            continue;
        }
        let mut raws = Vec::with_capacity(emails.len());
        for email in &emails {
            raws.push(reconstitute_eml(email).await?);
        }
        let container = container_bytes(&emails, &raws, format)?;
        let name = format!(
            "{}.{}",
            sanitize_file_name(&mailbox.name),
            format.extension()
        );
        zip_writer
            .start_file(name, options)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        zip_writer
            .write_all(&container)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        exported_any = true;
    }
    zip_writer
        .finish()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    if !exported_any {
        return Err(raise_error!(
            "There are no emails to export.".into(),
            ErrorCode::ResourceNotFound
        ));
    }
    write_tempfile(&buffer.into_inner())
}

fn write_tempfile(bytes: &[u8]) -> MailVaultResult<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    file.write_all(bytes)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    file.flush()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mailfile::format::FileFormat;
    use crate::modules::mailfile::import::{
        import_file,
        tests::{import_fixture, sample_message},
    };
    use crate::modules::mailfile::flat::write_mbox;
    use itertools::Itertools;

    #[tokio::test]
    async fn test_import_mbox_then_export_maildir_round_trips() {
        let source = import_fixture(61, "roundtrip-src@example.test").await;
        let file = write_mbox(&[
            sample_message("rt1"),
            sample_message("rt2"),
            sample_message("rt3"),
        ]);
        import_file(&source, &file, FileFormat::Mbox).await.unwrap();

        let emails = Email::list_for_mailbox(source.id).await.unwrap();
        let exported = export_emails(&emails, FileFormat::Maildir).await.unwrap();
        let zipped = std::fs::read(exported.path()).unwrap();

        // Re-import the produced maildir zip into a fresh mailbox.
        let target = import_fixture(62, "roundtrip-dst@example.test").await;
        let report = import_file(&target, &zipped, FileFormat::Maildir)
            .await
            .unwrap();
        assert_eq!(report.imported, 3);

        let originals = Email::list_for_mailbox(source.id).await.unwrap();
        let recovered = Email::list_for_mailbox(target.id).await.unwrap();
        let key = |email: &Email| {
            (
                email.message_id.clone(),
                email.subject.clone(),
                email.headers.clone(),
            )
        };
        let original_keys: Vec<_> = originals.iter().map(key).sorted().collect();
        let recovered_keys: Vec<_> = recovered.iter().map(key).sorted().collect();
        assert_eq!(original_keys, recovered_keys);
    }

    #[tokio::test]
    async fn test_export_single_eml_is_raw_message() {
        let mailbox = import_fixture(63, "single-export@example.test").await;
        import_file(&mailbox, &sample_message("only"), FileFormat::Eml)
            .await
            .unwrap();
        let emails = Email::list_for_mailbox(mailbox.id).await.unwrap();
        let exported = export_emails(&emails, FileFormat::Eml).await.unwrap();
        let bytes = std::fs::read(exported.path()).unwrap();
        let parsed = crate::modules::message::parser::parse_email(&bytes).unwrap();
        assert_eq!(parsed.message_id, "<only@e.test>");
    }

    #[tokio::test]
    async fn test_export_mbox_parses_back() {
        let mailbox = import_fixture(64, "mbox-export@example.test").await;
        let file = write_mbox(&[sample_message("x1"), sample_message("x2")]);
        import_file(&mailbox, &file, FileFormat::Mbox).await.unwrap();
        let emails = Email::list_for_mailbox(mailbox.id).await.unwrap();
        let exported = export_emails(&emails, FileFormat::Mbox).await.unwrap();
        let bytes = std::fs::read(exported.path()).unwrap();
        let members = crate::modules::mailfile::flat::split_mbox(&bytes).unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_export_mailboxes_wraps_containers_in_zip() {
        let mailbox = import_fixture(65, "zipwrap@example.test").await;
        import_file(&mailbox, &sample_message("zw"), FileFormat::Eml)
            .await
            .unwrap();
        let exported = export_mailboxes(&[mailbox.clone()], FileFormat::Mbox)
            .await
            .unwrap();
        let bytes = std::fs::read(exported.path()).unwrap();
        let entries = crate::modules::mailfile::tree::zip_entries(&bytes).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "INBOX.mbox");
    }

    #[tokio::test]
    async fn test_export_empty_queryset_fails() {
        let result = export_emails(&[], FileFormat::Mbox).await;
        assert_eq!(
            result.unwrap_err().code(),
            ErrorCode::ResourceNotFound
        );
    }

    #[tokio::test]
    async fn test_reconstitution_without_stored_eml_keeps_bodies() {
        let mailbox = import_fixture(66, "reserial@example.test").await;
        let mailbox = crate::modules::mailbox::entity::Mailbox::set_flags(
            mailbox.id,
            Some(false),
            None,
            None,
        )
        .await
        .unwrap();
        import_file(&mailbox, &sample_message("rebuild"), FileFormat::Eml)
            .await
            .unwrap();
        let emails = Email::list_for_mailbox(mailbox.id).await.unwrap();
        let raw = reconstitute_eml(&emails[0]).await.unwrap();
        let parsed = crate::modules::message::parser::parse_email(&raw).unwrap();
        assert_eq!(parsed.message_id, "<rebuild@e.test>");
        assert!(parsed.plain_body.contains("body rebuild"));
    }
}
