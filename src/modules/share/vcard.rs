use crate::modules::archive::correspondent::Correspondent;

/// Serializes correspondents as a vCard 3.0 stream, one card per contact.
///
/// List-serv headers ride along as X- properties so the contact server can
/// keep them without understanding RFC 2369.
pub fn to_vcard_stream(correspondents: &[Correspondent]) -> String {
    let mut out = String::new();
    for correspondent in correspondents {
        out.push_str(&to_vcard(correspondent));
    }
    out
}

pub fn to_vcard(correspondent: &Correspondent) -> String {
    let mut card = String::new();
    card.push_str("BEGIN:VCARD\r\n");
    card.push_str("VERSION:3.0\r\n");
    let formatted_name = correspondent
        .real_name
        .as_deref()
        .or(correspondent.display_name.as_deref())
        .unwrap_or(&correspondent.address);
    card.push_str(&format!("FN:{}\r\n", escape(formatted_name)));
    card.push_str(&format!(
        "EMAIL;TYPE=INTERNET:{}\r\n",
        escape(&correspondent.address)
    ));
    let list_serv = &correspondent.list_serv;
    let extras = [
        ("X-LIST-ID", &list_serv.list_id),
        ("X-LIST-OWNER", &list_serv.list_owner),
        ("X-LIST-SUBSCRIBE", &list_serv.list_subscribe),
        ("X-LIST-UNSUBSCRIBE", &list_serv.list_unsubscribe),
        ("X-LIST-POST", &list_serv.list_post),
        ("X-LIST-HELP", &list_serv.list_help),
        ("X-LIST-ARCHIVE", &list_serv.list_archive),
        ("X-LIST-UNSUBSCRIBE-POST", &list_serv.list_unsubscribe_post),
    ];
    for (property, value) in extras {
        if let Some(value) = value {
            card.push_str(&format!("{}:{}\r\n", property, escape(value)));
        }
    }
    card.push_str("END:VCARD\r\n");
    card
}

/// RFC 2426 text escaping.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(';', "\\;")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::archive::correspondent::ListServHeaders;

    fn sample() -> Correspondent {
        Correspondent {
            address: "alice@example.test".into(),
            display_name: Some("Alice; the first".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_vcard_has_required_properties() {
        let card = to_vcard(&sample());
        assert!(card.starts_with("BEGIN:VCARD\r\nVERSION:3.0\r\n"));
        assert!(card.contains("EMAIL;TYPE=INTERNET:alice@example.test\r\n"));
        assert!(card.ends_with("END:VCARD\r\n"));
    }

    #[test]
    fn test_vcard_escapes_special_characters() {
        let card = to_vcard(&sample());
        assert!(card.contains("FN:Alice\\; the first\r\n"));
    }

    #[test]
    fn test_real_name_wins_over_display_name() {
        let mut correspondent = sample();
        correspondent.real_name = Some("Alice Real".into());
        let card = to_vcard(&correspondent);
        assert!(card.contains("FN:Alice Real\r\n"));
    }

    #[test]
    fn test_list_serv_headers_become_x_properties() {
        let mut correspondent = sample();
        correspondent.list_serv = ListServHeaders {
            list_id: Some("announce.example.test".into()),
            ..Default::default()
        };
        let card = to_vcard(&correspondent);
        assert!(card.contains("X-LIST-ID:announce.example.test\r\n"));
        assert!(!card.contains("X-LIST-POST"));
    }

    #[test]
    fn test_stream_concatenates_cards() {
        let stream = to_vcard_stream(&[sample(), sample()]);
        assert_eq!(stream.matches("BEGIN:VCARD").count(), 2);
    }
}
