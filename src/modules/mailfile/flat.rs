//! Flat single-file containers: mbox (`From ` separators), MMDF
//! (`\x01\x01\x01\x01` delimiters) and Babyl (`\x1f` delimiters with an
//! EOOH marker).

use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::raise_error;

const MMDF_DELIMITER: &[u8] = b"\x01\x01\x01\x01\n";
const BABYL_MESSAGE_START: &[u8] = b"\x1f\x0c\n";
const BABYL_EOOH: &[u8] = b"*** EOOH ***\n";

/// Splits an mbox file into raw messages on `From ` separator lines,
/// undoing `>From ` quoting.
pub fn split_mbox(data: &[u8]) -> MailVaultResult<Vec<Vec<u8>>> {
    if !data.is_empty() && !data.starts_with(b"From ") {
        return Err(raise_error!(
            "The given file is not a valid mbox.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    for line in split_inclusive_lines(data) {
        if line.starts_with(b"From ") {
            if let Some(message) = current.take() {
                messages.push(message);
            }
            current = Some(Vec::new());
            continue;
        }
        if let Some(message) = current.as_mut() {
            if line.starts_with(b">From ") {
                message.extend_from_slice(&line[1..]);
            } else {
                message.extend_from_slice(line);
            }
        }
    }
    if let Some(message) = current {
        messages.push(message);
    }
    Ok(messages.into_iter().map(trim_trailing_blank).collect())
}

/// Serializes messages into mbox form, quoting `From ` lines in bodies.
pub fn write_mbox(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        out.extend_from_slice(b"From MAILER-DAEMON Thu Jan  1 00:00:00 1970\n");
        for line in split_inclusive_lines(message) {
            if line.starts_with(b"From ") {
                out.push(b'>');
            }
            out.extend_from_slice(line);
        }
        ensure_trailing_newline(&mut out);
        out.push(b'\n');
    }
    out
}

pub fn split_mmdf(data: &[u8]) -> MailVaultResult<Vec<Vec<u8>>> {
    if !data.is_empty() && !data.starts_with(b"\x01\x01\x01\x01") {
        return Err(raise_error!(
            "The given file is not a valid mmdf.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut messages = Vec::new();
    let mut rest = data;
    while let Some(start) = find(rest, MMDF_DELIMITER) {
        let after = &rest[start + MMDF_DELIMITER.len()..];
        let end = find(after, MMDF_DELIMITER).unwrap_or(after.len());
        let message = &after[..end];
        if !message.is_empty() {
            messages.push(trim_trailing_blank(message.to_vec()));
        }
        rest = &after[end.min(after.len())..];
        if rest.is_empty() {
            break;
        }
        // Step past the closing delimiter of this message.
        rest = &rest[MMDF_DELIMITER.len().min(rest.len())..];
    }
    Ok(messages)
}

pub fn write_mmdf(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        out.extend_from_slice(MMDF_DELIMITER);
        out.extend_from_slice(message);
        ensure_trailing_newline(&mut out);
        out.extend_from_slice(MMDF_DELIMITER);
    }
    out
}

/// Splits a Babyl file. Each message chunk carries a labels line and an
/// `*** EOOH ***` marker between the original headers and the body; the
/// original message is the headers plus the body. Chunks without the
/// marker are malformed and reported to the caller as `None` entries.
pub fn split_babyl(data: &[u8]) -> MailVaultResult<Vec<Option<Vec<u8>>>> {
    if !data.is_empty() && !data.starts_with(b"\x1f") && !data.starts_with(b"BABYL OPTIONS") {
        return Err(raise_error!(
            "The given file is not a valid babyl.".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut messages = Vec::new();
    for chunk in data.split(|&b| b == 0x1f) {
        let Some(chunk) = chunk.strip_prefix(&BABYL_MESSAGE_START[1..]) else {
            // Options section or trailing garbage.
            continue;
        };
        // Drop the labels line.
        let Some(after_labels) = find(chunk, b"\n").map(|i| &chunk[i + 1..]) else {
            messages.push(None);
            continue;
        };
        match find(after_labels, BABYL_EOOH) {
            Some(eooh) => {
                let headers = &after_labels[..eooh];
                let body = &after_labels[eooh + BABYL_EOOH.len()..];
                let mut message = Vec::with_capacity(headers.len() + body.len());
                message.extend_from_slice(headers);
                message.extend_from_slice(body);
                messages.push(Some(trim_trailing_blank(message)));
            }
            None => messages.push(None),
        }
    }
    Ok(messages)
}

pub fn write_babyl(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        out.extend_from_slice(BABYL_MESSAGE_START);
        out.extend_from_slice(b"1,,\n");
        let (headers, body) = split_at_blank_line(message);
        out.extend_from_slice(headers);
        out.extend_from_slice(BABYL_EOOH);
        out.extend_from_slice(body);
        ensure_trailing_newline(&mut out);
    }
    out.push(0x1f);
    out
}

/// (headers including the terminating blank line, body).
fn split_at_blank_line(message: &[u8]) -> (&[u8], &[u8]) {
    for (index, window) in message.windows(4).enumerate() {
        if window == b"\r\n\r\n" {
            return (&message[..index + 4], &message[index + 4..]);
        }
    }
    for (index, window) in message.windows(2).enumerate() {
        if window == b"\n\n" {
            return (&message[..index + 2], &message[index + 2..]);
        }
    }
    (message, b"")
}

fn split_inclusive_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split_inclusive(|&b| b == b'\n')
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn ensure_trailing_newline(out: &mut Vec<u8>) {
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
}

fn trim_trailing_blank(mut message: Vec<u8>) -> Vec<u8> {
    while message.ends_with(b"\n\n") || message.ends_with(b"\r\n\r\n") {
        message.pop();
        if message.ends_with(b"\r") {
            message.pop();
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u8) -> Vec<u8> {
        format!(
            "Message-ID: <m{id}@e.test>\nSubject: msg {id}\n\nbody of {id}\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_mbox_round_trip() {
        let messages = vec![sample(1), sample(2), sample(3)];
        let file = write_mbox(&messages);
        let parsed = split_mbox(&file).unwrap();
        assert_eq!(parsed.len(), 3);
        for (original, recovered) in messages.iter().zip(&parsed) {
            assert_eq!(
                String::from_utf8_lossy(recovered).trim_end(),
                String::from_utf8_lossy(original).trim_end()
            );
        }
    }

    #[test]
    fn test_mbox_from_stuffing_round_trips() {
        let message = b"Subject: quoting\n\nFrom here on out\nplain line\n".to_vec();
        let file = write_mbox(&[message.clone()]);
        // The body line was quoted on disk.
        assert!(find(&file, b"\n>From here").is_some());
        let parsed = split_mbox(&file).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&parsed[0]).trim_end(),
            String::from_utf8_lossy(&message).trim_end()
        );
    }

    #[test]
    fn test_mbox_rejects_non_mbox_data() {
        assert!(split_mbox(b"Message-ID: <x@y>\n\nnot an mbox\n").is_err());
    }

    #[test]
    fn test_mmdf_round_trip() {
        let messages = vec![sample(1), sample(2)];
        let file = write_mmdf(&messages);
        let parsed = split_mmdf(&file).unwrap();
        assert_eq!(parsed.len(), 2);
        for (original, recovered) in messages.iter().zip(&parsed) {
            assert_eq!(
                String::from_utf8_lossy(recovered).trim_end(),
                String::from_utf8_lossy(original).trim_end()
            );
        }
    }

    #[test]
    fn test_babyl_round_trip() {
        let messages = vec![sample(1), sample(2)];
        let file = write_babyl(&messages);
        let parsed = split_babyl(&file).unwrap();
        let recovered: Vec<_> = parsed.into_iter().flatten().collect();
        assert_eq!(recovered.len(), 2);
        for (original, recovered) in messages.iter().zip(&recovered) {
            assert_eq!(
                String::from_utf8_lossy(recovered).trim_end(),
                String::from_utf8_lossy(original).trim_end()
            );
        }
    }

    #[test]
    fn test_babyl_bad_member_is_reported_not_fatal() {
        let mut file = write_babyl(&[sample(1)]);
        // Append a message chunk with no EOOH marker.
        file.extend_from_slice(b"\x0c\n1,,\nMangled: yes\n");
        file.push(0x1f);
        let parsed = split_babyl(&file).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_some());
        assert!(parsed[1].is_none());
    }
}
