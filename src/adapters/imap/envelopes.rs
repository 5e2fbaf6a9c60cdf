//! FETCH result → normalized envelope.
//!
//! The IMAP ENVELOPE gives Message-ID, In-Reply-To, From, To, Subject and
//! Date. References is not in it, so it comes from a separate header fetch.
//! The raw source is passed through as the body; downstream owns MIME
//! decoding. An alternative fully-parsed path produces the same fields plus
//! attachments.

use async_imap::types::Fetch;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, ParsedMail};
use tracing::warn;

use crate::types::{Attachment, Envelope, IngestError};

/// A message observed in a FETCH, keyed by its position in the mailbox.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    pub seq: u32,
    pub uid: u32,
    pub envelope: Envelope,
}

/// Plain-field form of one fetched message, separated from the `Fetch`
/// wire type so envelope assembly is testable without a server.
#[derive(Debug, Clone, Default)]
pub struct FetchedFields {
    pub message_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub raw_source: String,
}

/// Build the normalized envelope, or `None` when the message must be
/// dropped: only a message with neither a Message-ID header nor any way
/// to synthesize an internal id is skipped.
pub fn observed_from_fetch(
    mailbox_id: &str,
    fetch: &Fetch,
    references: Vec<String>,
) -> Option<ObservedMessage> {
    let mut fields = extract_fields(fetch);
    fields.references = references;

    let uid = match identity_uid(fetch.uid, fetch.message, &fields.message_id) {
        Some(uid) => uid,
        None => {
            warn!(
                mailbox_id = %mailbox_id,
                seq = fetch.message,
                "dropping message with neither UID nor Message-ID"
            );
            return None;
        }
    };
    if fetch.uid.is_none() {
        warn!(
            mailbox_id = %mailbox_id,
            seq = fetch.message,
            "message has no UID, keying internal id by sequence number"
        );
    }

    Some(ObservedMessage {
        seq: fetch.message,
        uid,
        envelope: assemble_envelope(mailbox_id, uid, fields),
    })
}

/// The numeric component of the internal id: the server's UID when given,
/// the sequence number when the message still carries a Message-ID, and
/// `None` only when both identities are missing.
fn identity_uid(uid: Option<u32>, seq: u32, message_id: &str) -> Option<u32> {
    match uid {
        Some(uid) => Some(uid),
        None if message_id.is_empty() => None,
        None => Some(seq),
    }
}

/// Pure assembly of the envelope from plain fields.
pub fn assemble_envelope(mailbox_id: &str, uid: u32, fields: FetchedFields) -> Envelope {
    let wall_ms = Utc::now().timestamp_millis();
    let internal_id = Envelope::internal_id_for(mailbox_id, uid, wall_ms);
    let thread_id = if fields.in_reply_to.is_empty() {
        internal_id.clone()
    } else {
        fields.in_reply_to.clone()
    };
    let is_reply = Envelope::compute_is_reply(&fields.in_reply_to, &fields.references);

    Envelope {
        mailbox_id: mailbox_id.to_string(),
        message_id: fields.message_id,
        internal_id,
        thread_id,
        in_reply_to: fields.in_reply_to,
        references: fields.references,
        from_address: fields.from_address,
        to_addresses: fields.to_addresses,
        subject: fields.subject,
        body_text: fields.raw_source,
        received_at: fields.date.unwrap_or_else(Utc::now),
        is_reply,
        attachments: vec![],
    }
}

fn extract_fields(fetch: &Fetch) -> FetchedFields {
    let mut fields = FetchedFields::default();

    if let Some(envelope) = fetch.envelope() {
        fields.message_id = envelope
            .message_id
            .as_ref()
            .map(|id| strip_angle_brackets(&String::from_utf8_lossy(id)))
            .unwrap_or_default();

        fields.in_reply_to = envelope
            .in_reply_to
            .as_ref()
            .map(|id| strip_angle_brackets(&String::from_utf8_lossy(id)))
            .unwrap_or_default();

        fields.subject = envelope
            .subject
            .as_ref()
            .map(|s| decode_rfc2047(&String::from_utf8_lossy(s)))
            .unwrap_or_default();

        // First From address only
        fields.from_address = envelope
            .from
            .as_ref()
            .and_then(|addrs| addrs.first())
            .map(format_address)
            .unwrap_or_default();

        fields.to_addresses = envelope
            .to
            .as_ref()
            .map(|list| list.iter().map(format_address).collect())
            .unwrap_or_default();

        if let Some(date) = envelope.date.as_ref() {
            let date_str = String::from_utf8_lossy(date);
            if let Ok(secs) = mailparse::dateparse(&date_str) {
                fields.date = DateTime::from_timestamp(secs, 0);
            }
        }
    }

    if fields.date.is_none() {
        fields.date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
    }

    if let Some(body) = fetch.body() {
        fields.raw_source = String::from_utf8_lossy(body).to_string();
    }

    fields
}

fn format_address(addr: &imap_proto::types::Address<'_>) -> String {
    let mailbox = addr
        .mailbox
        .as_ref()
        .map(|m| String::from_utf8_lossy(m).to_string())
        .unwrap_or_default();
    let host = addr
        .host
        .as_ref()
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();
    if mailbox.is_empty() && host.is_empty() {
        String::new()
    } else {
        format!("{}@{}", mailbox, host)
    }
}

fn strip_angle_brackets(s: &str) -> String {
    s.trim().trim_matches(|c| c == '<' || c == '>').to_string()
}

/// Decode an RFC 2047 encoded-word by round-tripping through a fake header.
fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

/// Pull the Message-IDs out of a References header value, unfolding
/// continuation lines first.
pub fn parse_references_value(header_text: &str) -> Vec<String> {
    let unfolded = header_text.lines().fold(String::new(), |mut acc, line| {
        if !acc.is_empty() {
            acc.push(' ');
        }
        acc.push_str(line.trim());
        acc
    });

    let lower = unfolded.to_lowercase();
    let value = match lower.find("references:") {
        Some(pos) => &unfolded[pos + "references:".len()..],
        None => return vec![],
    };

    value
        .split_whitespace()
        .filter(|s| s.starts_with('<') && s.ends_with('>'))
        .map(|s| s[1..s.len() - 1].to_string())
        .collect()
}

/// References for one message out of a header-fields fetch.
pub fn references_from_fetch(fetch: &Fetch) -> Vec<String> {
    fetch
        .header()
        .map(|h| parse_references_value(&String::from_utf8_lossy(h)))
        .unwrap_or_default()
}

/// The fully-parsed path: run an RFC 5322 parser over the raw source and
/// produce the text body plus attachments.
pub fn parse_full_source(raw: &[u8]) -> Result<(String, Vec<Attachment>), IngestError> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| IngestError::Parse(e.to_string()))?;

    let mut body_text = String::new();
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut body_text, &mut attachments)?;

    if body_text.is_empty() && parsed.subparts.is_empty() {
        body_text = parsed
            .get_body()
            .map_err(|e| IngestError::Parse(e.to_string()))?;
    }

    Ok((body_text, attachments))
}

fn collect_parts(
    part: &ParsedMail<'_>,
    body_text: &mut String,
    attachments: &mut Vec<Attachment>,
) -> Result<(), IngestError> {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment {
            let filename = disposition
                .params
                .get("filename")
                .cloned()
                .unwrap_or_else(|| "unnamed".to_string());
            let data = part
                .get_body_raw()
                .map_err(|e| IngestError::Parse(e.to_string()))?;
            attachments.push(Attachment {
                filename,
                content_type: part.ctype.mimetype.clone(),
                size: data.len(),
                content_base64: BASE64.encode(&data),
            });
        } else if part.ctype.mimetype == "text/plain" && body_text.is_empty() {
            *body_text = part
                .get_body()
                .map_err(|e| IngestError::Parse(e.to_string()))?;
        }
    } else {
        for sub in &part.subparts {
            collect_parts(sub, body_text, attachments)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_round_trips_fields() {
        let fields = FetchedFields {
            message_id: "abc@example.com".into(),
            in_reply_to: "parent@example.com".into(),
            references: vec!["root@example.com".into(), "parent@example.com".into()],
            from_address: "alice@example.com".into(),
            to_addresses: vec!["bob@example.com".into(), "carol@example.com".into()],
            subject: "Re: quarterly numbers".into(),
            date: DateTime::from_timestamp(1_700_000_000, 0),
            raw_source: "raw message body".into(),
        };

        let env = assemble_envelope("mb-1", 42, fields.clone());
        assert_eq!(env.mailbox_id, "mb-1");
        assert_eq!(env.message_id, fields.message_id);
        assert_eq!(env.in_reply_to, fields.in_reply_to);
        assert_eq!(env.references, fields.references);
        assert_eq!(env.from_address, fields.from_address);
        assert_eq!(env.to_addresses, fields.to_addresses);
        assert_eq!(env.subject, fields.subject);
        assert_eq!(env.body_text, fields.raw_source);
        assert_eq!(env.received_at, fields.date.unwrap());
        assert!(env.is_reply);
        assert_eq!(env.thread_id, "parent@example.com");
        assert!(env.internal_id.starts_with("mb-1_42_"));
    }

    #[test]
    fn test_assemble_without_reply_context() {
        let env = assemble_envelope("mb-1", 7, FetchedFields::default());
        assert!(!env.is_reply);
        // Without In-Reply-To the thread collapses to the internal id.
        assert_eq!(env.thread_id, env.internal_id);
    }

    #[test]
    fn test_identity_uid_prefers_server_uid() {
        assert_eq!(identity_uid(Some(9), 3, ""), Some(9));
        assert_eq!(identity_uid(Some(9), 3, "id@example.com"), Some(9));
    }

    #[test]
    fn test_identity_uid_falls_back_to_seq_when_message_id_present() {
        assert_eq!(identity_uid(None, 3, "id@example.com"), Some(3));
    }

    #[test]
    fn test_identity_uid_drops_only_when_both_missing() {
        assert_eq!(identity_uid(None, 3, ""), None);
    }

    #[test]
    fn test_parse_references_value() {
        let refs = parse_references_value(
            "References: <a@example.com>\r\n <b@example.com> <c@example.com>",
        );
        assert_eq!(refs, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[test]
    fn test_parse_references_ignores_junk() {
        assert!(parse_references_value("Subject: hello").is_empty());
        assert!(parse_references_value("References: not-an-id").is_empty());
        assert!(parse_references_value("").is_empty());
    }

    #[test]
    fn test_decode_rfc2047_subject() {
        assert_eq!(
            decode_rfc2047("=?UTF-8?B?SGVsbG8gV29ybGQ=?="),
            "Hello World"
        );
        assert_eq!(decode_rfc2047("plain subject"), "plain subject");
    }

    #[test]
    fn test_strip_angle_brackets() {
        assert_eq!(strip_angle_brackets("<id@host>"), "id@host");
        assert_eq!(strip_angle_brackets("id@host"), "id@host");
        assert_eq!(strip_angle_brackets("  <id@host>  "), "id@host");
    }

    #[test]
    fn test_parse_full_source_plain() {
        let raw = b"From: alice@example.com\r\nSubject: hi\r\n\r\njust text";
        let (body, attachments) = parse_full_source(raw).unwrap();
        assert_eq!(body, "just text");
        assert!(attachments.is_empty());
    }

    #[test]
    fn test_parse_full_source_with_attachment() {
        let raw = concat!(
            "From: alice@example.com\r\n",
            "Subject: report\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--xyz\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--xyz--\r\n",
        )
        .as_bytes();

        let (body, attachments) = parse_full_source(raw).unwrap();
        assert_eq!(body.trim(), "see attached");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "report.pdf");
        assert_eq!(attachments[0].content_type, "application/pdf");
        assert!(attachments[0].size > 0);
    }
}
