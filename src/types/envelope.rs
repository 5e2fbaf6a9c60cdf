use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker appended to the body when an oversize message is cut down to fit
/// the downstream size cap.
pub const TRUNCATION_MARKER: &str = "\n\n[Message truncated]";

/// An attachment extracted on the fully-parsed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content_base64: String,
}

/// The normalized record emitted per observed message.
///
/// Not the IMAP ENVELOPE structure — that is one of its inputs. Constructed
/// by the session monitor from a FETCH result, handed to the sink adapter,
/// and not retained after successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub mailbox_id: String,
    /// Original Message-ID header; may be empty.
    pub message_id: String,
    /// Locally-assigned id, unique across the fleet.
    pub internal_id: String,
    /// In-Reply-To when present, else the internal id.
    pub thread_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub subject: String,
    /// Raw source passed through; downstream owns MIME decoding.
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub is_reply: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Envelope {
    /// Internal id format: `{mailbox_id}_{uid}_{wall_ms}`. When the server
    /// supplied no UID, the message's sequence number stands in.
    pub fn internal_id_for(mailbox_id: &str, uid: u32, wall_ms: i64) -> String {
        format!("{}_{}_{}", mailbox_id, uid, wall_ms)
    }

    pub fn compute_is_reply(in_reply_to: &str, references: &[String]) -> bool {
        !in_reply_to.is_empty() || !references.is_empty()
    }

    /// Serialized form submitted to the sink.
    pub fn to_sink_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// If the serialized payload would exceed `max_payload` bytes, cut the
    /// body down to `truncate_at` bytes and append the truncation marker.
    /// All other fields are preserved. Returns true if truncation happened.
    pub fn enforce_size_cap(&mut self, max_payload: usize, truncate_at: usize) -> bool {
        let serialized_len = match self.to_sink_json() {
            Ok(json) => json.len(),
            Err(_) => return false,
        };
        if serialized_len <= max_payload {
            return false;
        }

        let mut cut = truncate_at.min(self.body_text.len());
        while cut > 0 && !self.body_text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.body_text.truncate(cut);
        self.body_text.push_str(TRUNCATION_MARKER);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: String) -> Envelope {
        Envelope {
            mailbox_id: "mb-1".into(),
            message_id: "<abc@example.com>".into(),
            internal_id: Envelope::internal_id_for("mb-1", 42, 1700000000000),
            thread_id: "<parent@example.com>".into(),
            in_reply_to: "<parent@example.com>".into(),
            references: vec!["<root@example.com>".into()],
            from_address: "alice@example.com".into(),
            to_addresses: vec!["bob@example.com".into()],
            subject: "hello".into(),
            body_text: body,
            received_at: Utc::now(),
            is_reply: true,
            attachments: vec![],
        }
    }

    #[test]
    fn test_internal_id_format() {
        assert_eq!(
            Envelope::internal_id_for("mb-1", 42, 1700000000000),
            "mb-1_42_1700000000000"
        );
    }

    #[test]
    fn test_is_reply() {
        assert!(Envelope::compute_is_reply("<x@y>", &[]));
        assert!(Envelope::compute_is_reply("", &["<x@y>".into()]));
        assert!(!Envelope::compute_is_reply("", &[]));
    }

    #[test]
    fn test_size_cap_leaves_small_bodies_alone() {
        let mut env = envelope("short body".into());
        assert!(!env.enforce_size_cap(256_000, 200_000));
        assert_eq!(env.body_text, "short body");
    }

    #[test]
    fn test_size_cap_truncates_oversize() {
        let mut env = envelope("x".repeat(300_000));
        assert!(env.enforce_size_cap(256_000, 200_000));
        assert!(env.body_text.ends_with(TRUNCATION_MARKER));
        assert!(env.body_text.len() <= 200_000 + TRUNCATION_MARKER.len());
        // Other fields untouched
        assert_eq!(env.subject, "hello");
        assert_eq!(env.message_id, "<abc@example.com>");
    }

    #[test]
    fn test_size_cap_respects_char_boundaries() {
        // Multi-byte characters straddling the cut point must not panic.
        let mut env = envelope("é".repeat(150_000));
        assert!(env.enforce_size_cap(100, 50));
        assert!(env.body_text.ends_with(TRUNCATION_MARKER));
    }
}
