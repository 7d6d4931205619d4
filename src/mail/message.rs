//! Room message to MIME message conversion.

use mail_builder::{
    MessageBuilder,
    headers::{content_type::ContentType, date::Date, raw::Raw},
    mime::MimePart,
};

use crate::{
    error::{Error, Result},
    matrix::events::MessageEvent,
};

/// Subjects of this many characters or more get truncated.
const SUBJECT_MAX_CHARS: usize = 70;
const SUBJECT_ELLIPSIS: &str = "...";

/// Derives a mail subject from the first line of a message body.
///
/// ```
/// # use mxmda::mail::message::subject;
/// assert_eq!(subject("  Hello\nworld"), "Hello");
/// ```
pub fn subject(body: &str) -> String {
    let first_line = body.trim().lines().next().unwrap_or_default();
    if first_line.chars().count() < SUBJECT_MAX_CHARS {
        return first_line.to_owned();
    }

    let kept = SUBJECT_MAX_CHARS - SUBJECT_ELLIPSIS.len();
    let mut truncated: String = first_line.chars().take(kept).collect();
    truncated.push_str(SUBJECT_ELLIPSIS);
    truncated
}

/// Turns a Matrix identifier into a mail address.
///
/// The sigil (`@`, `!` or `#`) is dropped and the first `:` becomes `@`, so
/// `@alice:example.com` is delivered as `alice@example.com`. Identifiers without
/// a server part, like the room IDs of recent room versions, are kept as is.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentifier`] if the identifier has no sigil.
pub fn mxid_to_email(identifier: &str) -> Result<String> {
    identifier
        .strip_prefix(['@', '!', '#'])
        .map(|rest| rest.replacen(':', "@", 1))
        .ok_or_else(|| Error::InvalidIdentifier(identifier.to_owned()))
}

/// Composes the mail for a room message.
///
/// The mail is a `multipart/alternative` with the plain text body and the full
/// original event, pretty-printed, under an `application/mxmda` part. Addresses
/// are written verbatim: server names with a port or an IPv6 literal are valid
/// Matrix identifiers but not valid mail domains.
pub fn event_to_mail(event: &MessageEvent) -> Result<MessageBuilder<'_>> {
    let body = event.body.trim();

    let event_part = MimePart::new(
        ContentType::new("application/mxmda")
            .attribute("type", event.event_type())
            .attribute("charset", "utf-8"),
        serde_json::to_string_pretty(&event.source)?,
    )
    // Keeps the JSON readable
    .header("Content-Transfer-Encoding", Raw::new("8bit"));

    let text_part = MimePart::new(
        ContentType::new("text/plain").attribute("charset", "utf-8"),
        body,
    );

    Ok(MessageBuilder::new()
        .header("From", Raw::new(mxid_to_email(&event.sender)?))
        .header("To", Raw::new(mxid_to_email(&event.room.machine_name)?))
        .header("Message-ID", Raw::new(event.event_id.as_str()))
        .subject(subject(body))
        .date(Date::new(delivery_time(event)))
        .body(MimePart::new(
            "multipart/alternative",
            vec![text_part, event_part],
        )))
}

/// Renders a composed mail with LF line endings, as maildir readers expect.
pub fn to_maildir_bytes(mail: MessageBuilder<'_>) -> Result<Vec<u8>> {
    let formatted = mail.write_to_string()?;
    Ok(formatted.replace("\r\n", "\n").into_bytes())
}

/// Date of the mail for `event`, in seconds since the epoch.
pub fn delivery_time(event: &MessageEvent) -> i64 {
    i64::try_from(event.server_timestamp / 1000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::events::RoomRef;
    use serde_json::json;

    fn create_event() -> MessageEvent {
        MessageEvent {
            room: RoomRef::new("!room:example.com"),
            sender: "@alice:example.com".to_owned(),
            event_id: "$1".to_owned(),
            body: "Hello\nworld".to_owned(),
            server_timestamp: 1_700_000_000_000,
            source: json!({
                "type": "m.room.message",
                "event_id": "$1",
                "sender": "@alice:example.com",
                "origin_server_ts": 1_700_000_000_000u64,
                "content": {"msgtype": "m.text", "body": "Hello\nworld"},
            }),
        }
    }

    fn render(event: &MessageEvent) -> String {
        String::from_utf8(to_maildir_bytes(event_to_mail(event).unwrap()).unwrap()).unwrap()
    }

    #[test]
    fn test_subject_short_line() {
        let line = "a".repeat(69);
        assert_eq!(subject(&line), line);
        assert_eq!(subject("Hello\nworld"), "Hello");
        assert_eq!(subject("\n\n  Hello  \nworld"), "Hello");
        assert_eq!(subject(""), "");
    }

    #[test]
    fn test_subject_truncation() {
        let line = "a".repeat(70);
        assert_eq!(subject(&line), format!("{}...", "a".repeat(67)));

        let line = "b".repeat(71);
        let truncated = subject(&line);
        assert_eq!(truncated.chars().count(), 70);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_subject_counts_characters() {
        // 69 two-byte characters stay whole
        let line = "é".repeat(69);
        assert_eq!(subject(&line), line);

        let line = "é".repeat(80);
        assert_eq!(subject(&line), format!("{}...", "é".repeat(67)));
    }

    #[test]
    fn test_mxid_to_email() {
        assert_eq!(mxid_to_email("@a:b.c").unwrap(), "a@b.c");
        assert_eq!(
            mxid_to_email("!room:example.com").unwrap(),
            "room@example.com"
        );
        assert_eq!(
            mxid_to_email("#general:example.com").unwrap(),
            "general@example.com"
        );
        // Only the first colon separates the server
        assert_eq!(mxid_to_email("@a:b.c:8448").unwrap(), "a@b.c:8448");
        assert_eq!(
            mxid_to_email("@alice:[1234:5678::abcd]").unwrap(),
            "alice@[1234:5678::abcd]"
        );
    }

    #[test]
    fn test_mxid_to_email_without_server() {
        assert_eq!(mxid_to_email("!abcdefHASH").unwrap(), "abcdefHASH");
        assert_eq!(mxid_to_email("@alice").unwrap(), "alice");
    }

    #[test]
    fn test_mxid_to_email_without_sigil() {
        assert!(matches!(
            mxid_to_email("alice:example.com"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(
            mxid_to_email(""),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_event_to_mail() {
        let text = render(&create_event());
        let (headers, _) = text.split_once("\n\n").unwrap();

        assert!(!text.contains('\r'));
        assert!(headers.contains("Subject: Hello\n"));
        assert!(headers.contains("From: alice@example.com\n"));
        assert!(headers.contains("To: room@example.com\n"));
        assert!(headers.contains("Message-ID: $1\n"));
        assert!(headers.contains("14 Nov 2023 22:13:20"));
        assert!(headers.contains("multipart/alternative"));
        assert!(text.contains("text/plain"));
        assert!(text.contains("application/mxmda"));
        assert!(text.contains("m.room.message"));
        assert!(text.contains("Content-Transfer-Encoding: 8bit"));
        assert!(text.contains("Hello\nworld"));
        assert!(text.contains("\"event_id\": \"$1\""));
        assert!(text.contains("\"body\": \"Hello\\nworld\""));
    }

    #[test]
    fn test_event_to_mail_strips_body() {
        let mut event = create_event();
        event.body = "\n  Hello\nworld  \n\n".to_owned();

        let text = render(&event);
        assert!(text.contains("Subject: Hello\n"));
        assert!(text.contains("Hello\nworld"));
        assert!(!text.contains("  Hello"));
        assert!(!text.contains("world  "));
    }

    #[test]
    fn test_event_to_mail_uses_room_alias() {
        let mut event = create_event();
        event.room = RoomRef::with_alias("!room:example.com", Some("#general:example.com"));

        assert!(render(&event).contains("To: general@example.com\n"));
    }

    #[test]
    fn test_event_to_mail_with_port_and_ipv6_servers() {
        let mut event = create_event();
        event.sender = "@alice:example.com:8448".to_owned();
        event.room = RoomRef::new("!room:[1234:5678::abcd]");

        let text = render(&event);
        assert!(text.contains("From: alice@example.com:8448\n"));
        assert!(text.contains("To: room@[1234:5678::abcd]\n"));
    }

    #[test]
    fn test_event_to_mail_room_without_server() {
        let mut event = create_event();
        event.room = RoomRef::new("!abcdefHASH");

        assert!(render(&event).contains("To: abcdefHASH\n"));
    }

    #[test]
    fn test_event_to_mail_invalid_sender() {
        let mut event = create_event();
        event.sender = "alice".to_owned();

        assert!(matches!(
            event_to_mail(&event),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_delivery_time() {
        assert_eq!(delivery_time(&create_event()), 1_700_000_000);
    }
}
