use crate::modules::archive::correspondent::{ListServHeaders, Mention};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::utils::hash;
use crate::{raise_error, utc_now};
use mail_parser::{Address, HeaderName, HeaderValue, Message, MessageParser, MimeHeaders};
use tracing::warn;

/// One correspondent sighting: the header field it appeared in, the
/// address, and the display name if the header carried one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedCorrespondent {
    pub mention: Mention,
    pub address: String,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedAttachment {
    pub file_name: String,
    pub content_maintype: String,
    pub content_subtype: String,
    pub content_disposition: Option<String>,
    /// Angle brackets preserved.
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

/// Normalized form of one raw message, ready for the archive writer.
#[derive(Clone, Debug, Default)]
pub struct ParsedEmail {
    pub message_id: String,
    pub subject: String,
    /// Sent timestamp, UTC epoch millis. Synthesized from Received headers
    /// or the fetch time when the Date header is missing or unparsable.
    pub sent_at: i64,
    pub plain_body: String,
    pub html_body: String,
    /// Ordered header multimap, keys lowercased, values unfolded.
    pub headers: Vec<(String, String)>,
    pub is_spam: bool,
    pub correspondents: Vec<ParsedCorrespondent>,
    pub attachments: Vec<ParsedAttachment>,
    pub references: Vec<String>,
    pub in_reply_to: Vec<String>,
    pub list_serv: ListServHeaders,
    pub datasize: u64,
}

/// Decodes raw message bytes into a `ParsedEmail`.
pub fn parse_email(raw: &[u8]) -> MailVaultResult<ParsedEmail> {
    // Messages lifted out of an mbox may still carry the "From " separator.
    let raw = strip_mbox_from_line(raw);

    let message = MessageParser::default().parse(raw).ok_or_else(|| {
        raise_error!(
            "Failed to parse message bytes as RFC 5322 email".into(),
            ErrorCode::EmlFileParseError
        )
    })?;

    let headers = collect_headers(&message);
    let sent_at = resolve_sent_at(&message);
    let message_id = message
        .message_id()
        .map(|id| format!("<{}>", id.trim_start_matches('<').trim_end_matches('>')))
        .unwrap_or_else(|| synthesized_message_id(raw));

    Ok(ParsedEmail {
        message_id,
        subject: message.subject().unwrap_or_default().to_string(),
        sent_at,
        plain_body: message.body_text(0).unwrap_or_default().to_string(),
        html_body: message.body_html(0).unwrap_or_default().to_string(),
        is_spam: spam_flag(&headers),
        correspondents: collect_correspondents(&message, &headers),
        attachments: collect_attachments(&message),
        references: id_list(message.references()),
        in_reply_to: id_list(message.in_reply_to()),
        list_serv: collect_list_serv(&headers),
        datasize: raw.len() as u64,
        headers,
    })
}

/// Drops a leading mbox `From ` separator line if present.
fn strip_mbox_from_line(raw: &[u8]) -> &[u8] {
    if raw.starts_with(b"From ") {
        if let Some(position) = raw.iter().position(|&b| b == b'\n') {
            return &raw[position + 1..];
        }
    }
    raw
}

fn synthesized_message_id(raw: &[u8]) -> String {
    // Without a Message-ID the (mailbox, message-id) dedup guard still
    // needs a stable key, so one is derived from the content.
    let digest = hash(&String::from_utf8_lossy(raw));
    format!("<{:016x}@mailvault.generated>", digest)
}

fn collect_headers(message: &Message<'_>) -> Vec<(String, String)> {
    let raw = message.raw_message.as_ref();
    message
        .headers()
        .iter()
        .map(|header| {
            let value = raw
                .get(header.offset_start as usize..header.offset_end as usize)
                .map(|bytes| unfold(&String::from_utf8_lossy(bytes)))
                .unwrap_or_default();
            (header.name.as_str().to_lowercase(), value)
        })
        .collect()
}

/// Unfolds header continuation lines into single-space separators.
fn unfold(value: &str) -> String {
    value
        .replace("\r\n", "\n")
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// True iff any X-Spam-Flag header token equals YES, case-insensitively.
fn spam_flag(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .filter(|(name, _)| name == "x-spam-flag")
        .any(|(_, value)| {
            value
                .split_whitespace()
                .any(|token| token.eq_ignore_ascii_case("YES"))
        })
}

fn resolve_sent_at(message: &Message<'_>) -> i64 {
    if let Some(date) = message.date() {
        return date.to_timestamp() * 1000;
    }
    // No Date header: use the earliest Received timestamp.
    let earliest_received = message
        .headers()
        .iter()
        .filter(|header| header.name == HeaderName::Received)
        .filter_map(|header| match &header.value {
            HeaderValue::Received(received) => received.date.as_ref().map(|d| d.to_timestamp()),
            _ => None,
        })
        .min();
    match earliest_received {
        Some(timestamp) => timestamp * 1000,
        None => {
            warn!("Message has neither Date nor dated Received headers; using fetch time");
            utc_now!()
        }
    }
}

fn push_address_list(
    out: &mut Vec<ParsedCorrespondent>,
    mention: Mention,
    address: Option<&Address<'_>>,
) {
    let Some(address) = address else {
        return;
    };
    let addrs: Vec<&mail_parser::Addr<'_>> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .collect(),
    };
    for addr in addrs {
        if let Some(email) = addr.address.as_deref() {
            out.push(ParsedCorrespondent {
                mention,
                address: email.to_string(),
                display_name: addr.name.as_deref().map(str::to_string),
            });
        }
    }
}

fn collect_correspondents(
    message: &Message<'_>,
    headers: &[(String, String)],
) -> Vec<ParsedCorrespondent> {
    let mut out = Vec::new();
    push_address_list(&mut out, Mention::From, message.from());
    push_address_list(&mut out, Mention::To, message.to());
    push_address_list(&mut out, Mention::Cc, message.cc());
    push_address_list(&mut out, Mention::Bcc, message.bcc());
    push_address_list(&mut out, Mention::ReplyTo, message.reply_to());
    push_address_list(&mut out, Mention::Sender, message.sender());
    if let Some(return_path) = message.return_address() {
        if !return_path.is_empty() {
            out.push(ParsedCorrespondent {
                mention: Mention::ReturnPath,
                address: return_path.to_string(),
                display_name: None,
            });
        }
    }
    // Envelope-To has no dedicated parser; take the bare address form.
    for (_, value) in headers.iter().filter(|(name, _)| name == "envelope-to") {
        let address = value
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        if !address.is_empty() {
            out.push(ParsedCorrespondent {
                mention: Mention::EnvelopeTo,
                address,
                display_name: None,
            });
        }
    }
    out
}

fn collect_attachments(message: &Message<'_>) -> Vec<ParsedAttachment> {
    let mut out = Vec::new();
    for part in message.attachments() {
        if part.is_encoding_problem {
            warn!("Skipping malformed MIME part");
            continue;
        }
        let content_id = part
            .content_id()
            .map(|id| format!("<{}>", id.trim_start_matches('<').trim_end_matches('>')));
        let file_name = part.attachment_name().map(str::to_string);
        // An attachment is a named part, or an inline part with a
        // Content-ID. Anonymous parts without either are not archived.
        let file_name = match (file_name, &content_id) {
            (Some(name), _) => name,
            (None, Some(id)) => format!(
                "inline-{}",
                id.trim_start_matches('<').trim_end_matches('>')
            ),
            (None, None) => continue,
        };
        let (maintype, subtype) = match part.content_type() {
            Some(content_type) => (
                content_type.ctype().to_string(),
                content_type
                    .subtype()
                    .unwrap_or("octet-stream")
                    .to_string(),
            ),
            None => ("application".to_string(), "octet-stream".to_string()),
        };
        let content_disposition = part
            .content_disposition()
            .map(|disposition| disposition.ctype().to_string());
        out.push(ParsedAttachment {
            file_name,
            content_maintype: maintype,
            content_subtype: subtype,
            content_disposition,
            content_id,
            data: part.contents().to_vec(),
        });
    }
    out
}

fn id_list(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => vec![normalize_msg_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| normalize_msg_id(id)).collect(),
        _ => Vec::new(),
    }
}

fn normalize_msg_id(id: &str) -> String {
    format!("<{}>", id.trim_start_matches('<').trim_end_matches('>'))
}

fn collect_list_serv(headers: &[(String, String)]) -> ListServHeaders {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(header_name, _)| header_name == name)
            .map(|(_, value)| value.clone())
    };
    ListServHeaders {
        list_id: find("list-id"),
        list_owner: find("list-owner"),
        list_subscribe: find("list-subscribe"),
        list_unsubscribe: find("list-unsubscribe"),
        list_post: find("list-post"),
        list_help: find("list-help"),
        list_archive: find("list-archive"),
        list_unsubscribe_post: find("list-unsubscribe-post"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Message-ID: <abc@e.test>\r\n\
Subject: Hello\r\n\
From: Alice <a@x.test>\r\n\
To: u@e.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
body text\r\n";

    #[test]
    fn test_parse_simple_message() {
        let parsed = parse_email(SIMPLE).unwrap();
        assert_eq!(parsed.message_id, "<abc@e.test>");
        assert_eq!(parsed.subject, "Hello");
        assert_eq!(parsed.plain_body.trim(), "body text");
        assert!(!parsed.is_spam);
        assert_eq!(parsed.datasize, SIMPLE.len() as u64);
        let mentions: Vec<_> = parsed
            .correspondents
            .iter()
            .map(|c| (c.mention, c.address.as_str()))
            .collect();
        assert!(mentions.contains(&(Mention::From, "a@x.test")));
        assert!(mentions.contains(&(Mention::To, "u@e.test")));
        let from = parsed
            .correspondents
            .iter()
            .find(|c| c.mention == Mention::From)
            .unwrap();
        assert_eq!(from.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_headers_keep_order_and_duplicates() {
        let raw = b"Received: from a by b; Tue, 5 Mar 2024 10:00:02 +0000\r\n\
Received: from c by d; Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Message-ID: <dup@e.test>\r\n\
From: a@x.test\r\n\
Subject: dup headers\r\n\
\r\n\
x\r\n";
        let parsed = parse_email(raw).unwrap();
        let received: Vec<_> = parsed
            .headers
            .iter()
            .filter(|(name, _)| name == "received")
            .collect();
        assert_eq!(received.len(), 2);
        assert!(received[0].1.contains("from a by b"));
        assert!(received[1].1.contains("from c by d"));
    }

    #[test]
    fn test_spam_flag_is_case_insensitive() {
        let raw = b"Message-ID: <spam@e.test>\r\n\
From: a@x.test\r\n\
X-Spam-Flag: yes\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
\r\n\
x\r\n";
        assert!(parse_email(raw).unwrap().is_spam);

        let raw = b"Message-ID: <ham@e.test>\r\n\
From: a@x.test\r\n\
X-Spam-Flag: no\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
\r\n\
x\r\n";
        assert!(!parse_email(raw).unwrap().is_spam);
    }

    #[test]
    fn test_mbox_from_line_is_stripped() {
        let mut raw = b"From a@x.test Tue Mar  5 10:00:00 2024\r\n".to_vec();
        raw.extend_from_slice(SIMPLE);
        let parsed = parse_email(&raw).unwrap();
        assert_eq!(parsed.message_id, "<abc@e.test>");
        assert!(!parsed.headers.iter().any(|(name, _)| name == "from a@x.test"));
    }

    #[test]
    fn test_missing_date_falls_back_to_received() {
        let raw = b"Message-ID: <nodate@e.test>\r\n\
Received: from relay2 by mx2; Tue, 5 Mar 2024 10:00:05 +0000\r\n\
Received: from relay1 by mx1; Tue, 5 Mar 2024 09:59:55 +0000\r\n\
From: a@x.test\r\n\
\r\n\
x\r\n";
        let parsed = parse_email(raw).unwrap();
        // The earliest Received timestamp wins.
        assert_eq!(parsed.sent_at, 1_709_632_795_000);
    }

    #[test]
    fn test_missing_date_and_received_uses_fetch_time() {
        let raw = b"Message-ID: <bare@e.test>\r\nFrom: a@x.test\r\n\r\nx\r\n";
        let before = crate::utc_now!();
        let parsed = parse_email(raw).unwrap();
        assert!(parsed.sent_at >= before);
    }

    #[test]
    fn test_missing_message_id_is_synthesized_stably() {
        let raw = b"From: a@x.test\r\nSubject: anon\r\n\r\nx\r\n";
        let first = parse_email(raw).unwrap();
        let second = parse_email(raw).unwrap();
        assert!(first.message_id.ends_with("@mailvault.generated>"));
        assert_eq!(first.message_id, second.message_id);
    }

    #[test]
    fn test_multipart_attachment_extraction() {
        let raw = b"Message-ID: <att@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: multipart/alternative; boundary=\"a\"\r\n\
\r\n\
--a\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain part\r\n\
--a\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html part</p>\r\n\
--a--\r\n\
--b\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--b--\r\n";
        let parsed = parse_email(raw).unwrap();
        assert!(parsed.plain_body.contains("plain part"));
        assert!(parsed.html_body.contains("html part"));
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.file_name, "report.pdf");
        assert_eq!(attachment.content_maintype, "application");
        assert_eq!(attachment.content_subtype, "pdf");
        assert_eq!(attachment.content_disposition.as_deref(), Some("attachment"));
        assert_eq!(attachment.data, b"%PDF-1.4");
    }

    #[test]
    fn test_inline_part_with_content_id_is_an_attachment() {
        let raw = b"Message-ID: <cid@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Content-Type: multipart/related; boundary=\"r\"\r\n\
\r\n\
--r\r\n\
Content-Type: text/html\r\n\
\r\n\
<img src=\"cid:img1\">\r\n\
--r\r\n\
Content-Type: image/png\r\n\
Content-ID: <img1@e.test>\r\n\
Content-Disposition: inline\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--r--\r\n";
        let parsed = parse_email(raw).unwrap();
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.content_id.as_deref(), Some("<img1@e.test>"));
        assert_eq!(attachment.content_disposition.as_deref(), Some("inline"));
    }

    #[test]
    fn test_references_and_in_reply_to() {
        let raw = b"Message-ID: <child@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
In-Reply-To: <parent@e.test>\r\n\
References: <root@e.test> <parent@e.test>\r\n\
\r\n\
x\r\n";
        let parsed = parse_email(raw).unwrap();
        assert_eq!(parsed.in_reply_to, vec!["<parent@e.test>"]);
        assert_eq!(
            parsed.references,
            vec!["<root@e.test>", "<parent@e.test>"]
        );
    }

    #[test]
    fn test_list_serv_headers_are_captured() {
        let raw = b"Message-ID: <list@e.test>\r\n\
From: announce@lists.example.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
List-Id: Announcements <announce.lists.example.test>\r\n\
List-Unsubscribe: <mailto:leave@lists.example.test>\r\n\
\r\n\
x\r\n";
        let parsed = parse_email(raw).unwrap();
        assert_eq!(
            parsed.list_serv.list_id.as_deref(),
            Some("Announcements <announce.lists.example.test>")
        );
        assert!(parsed.list_serv.list_unsubscribe.is_some());
        assert!(parsed.list_serv.list_post.is_none());
    }

    #[test]
    fn test_quoted_printable_body_is_decoded() {
        let raw = b"Message-ID: <qp@e.test>\r\n\
From: a@x.test\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9\r\n";
        let parsed = parse_email(raw).unwrap();
        assert!(parsed.plain_body.contains("café"));
    }
}
