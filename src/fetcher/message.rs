//! Parsing fetched messages into broker payloads

use crate::imap::RawMessage;
use crate::types::TaskId;
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Headers by lowercased name, values unfolded, in message order
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Entry appended to a task's contact topic, one per accepted message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMessage {
    /// Task the message was mined for
    pub mining_id: TaskId,
    /// Owning user
    pub user_id: String,
    /// Mined mailbox address
    pub user_email: String,
    /// Folder the message was fetched from
    pub folder: String,
    /// Sequence number within the folder
    pub seq: u32,
    /// Messages in the folder when the run was planned
    pub total_in_folder: u32,
    /// Whether this is the folder's last message
    pub is_last: bool,
    /// Canonical message id
    pub message_id: String,
    /// Parsed header fields
    pub header: HeaderMap,
}

/// Entry on a task's signature topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignatureMessage {
    /// Body text of one message, for signature extraction
    #[serde(rename_all = "camelCase")]
    Email {
        /// Task the message was mined for
        mining_id: TaskId,
        /// Owning user
        user_id: String,
        /// Mined mailbox address
        user_email: String,
        /// Canonical message id
        message_id: String,
        /// Sender address
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Date header as RFC 3339
        #[serde(skip_serializing_if = "Option::is_none")]
        date: Option<String>,
        /// Plain-text body, truncated
        text: String,
    },

    /// No further entries follow for this task
    #[serde(rename_all = "camelCase")]
    End {
        /// Finished task
        mining_id: TaskId,
    },
}

/// Fields of one fetched message needed for publishing
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedMessage {
    /// Canonical message id
    pub message_id: String,
    /// Header fields
    pub header: HeaderMap,
    /// Sender address
    pub from: Option<String>,
    /// Date header as RFC 3339
    pub date: Option<String>,
    /// Plain-text body truncated to the limit; `None` when empty or not fetched
    pub text: Option<String>,
}

/// Parse a fetched message.
///
/// Returns `None` when the header block is empty or unparseable.
pub fn parse_message(raw: &RawMessage, signature_max_length: usize) -> Option<ParsedMessage> {
    if raw.header.is_empty() {
        return None;
    }

    let parser = MessageParser::default();
    let message = parser.parse(raw.header.as_slice())?;

    let mut header = HeaderMap::new();
    for (name, value) in message.headers_raw() {
        header
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(unfold(value));
    }

    let message_id = message
        .message_id()
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthesize_message_id(&header));

    let from = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| addr.address())
        .map(|address| address.to_ascii_lowercase());
    let date = message.date().map(|date| date.to_rfc3339());

    let text = match &raw.text {
        Some(text) if !text.is_empty() => {
            // parse as one message so MIME structure and transfer encodings apply
            let full = [raw.header.as_slice(), text.as_slice()].concat();
            parser
                .parse(full.as_slice())
                .and_then(|full| full.body_text(0).map(|body| truncate(body.trim(), signature_max_length)))
                .filter(|body| !body.is_empty())
        }
        _ => None,
    };

    Some(ParsedMessage {
        message_id,
        header,
        from,
        date,
        text,
    })
}

fn unfold(value: &str) -> String {
    value.replace("\r\n", "").replace('\n', "").trim().to_string()
}

fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Deterministic id for messages lacking a Message-ID header
pub fn synthesize_message_id(header: &HeaderMap) -> String {
    let field = |name: &str| {
        header
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or_default()
    };

    let mut hasher = Sha256::new();
    hasher.update(field("from"));
    hasher.update(b"|");
    hasher.update(field("date"));
    hasher.update(b"|");
    hasher.update(field("subject"));
    hasher.update(b"|");
    hasher.update(field("to"));
    format!("{:x}", hasher.finalize())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{message, message_without_id};

    fn raw(seq: u32, header: &str, text: Option<&str>) -> RawMessage {
        RawMessage {
            seq,
            header: header.as_bytes().to_vec(),
            text: text.map(|t| t.as_bytes().to_vec()),
        }
    }

    #[test]
    fn header_fields_and_id_are_extracted() {
        let fake = message("abc@host", "Alice <Alice@Example.com>", "hi there", None);
        let parsed = parse_message(&raw(1, &fake.header, None), 100).unwrap();

        assert_eq!(parsed.message_id, "abc@host");
        assert_eq!(parsed.from.as_deref(), Some("alice@example.com"));
        assert_eq!(parsed.header["subject"], vec!["hi there"]);
        assert_eq!(parsed.header["from"], vec!["Alice <Alice@Example.com>"]);
        assert!(parsed.date.unwrap().starts_with("2024-10-07T10:00:00"));
        assert!(parsed.text.is_none());
    }

    #[test]
    fn folded_headers_are_unfolded_and_repeated_ones_kept() {
        let header = "Message-ID: <x@y>\r\nReceived: from a\r\n by b\r\nReceived: from c\r\nSubject: long\r\n subject\r\n\r\n";
        let parsed = parse_message(&raw(1, header, None), 100).unwrap();
        assert_eq!(parsed.header["received"], vec!["from a by b", "from c"]);
        assert_eq!(parsed.header["subject"], vec!["long subject"]);
    }

    #[test]
    fn missing_message_id_is_synthesized_deterministically() {
        let fake = message_without_id("bob@example.com", "no id");
        let first = parse_message(&raw(1, &fake.header, None), 100).unwrap();
        let again = parse_message(&raw(7, &fake.header, None), 100).unwrap();
        assert_eq!(first.message_id, again.message_id);
        assert_eq!(first.message_id.len(), 64);

        let other = message_without_id("bob@example.com", "different");
        let other = parse_message(&raw(1, &other.header, None), 100).unwrap();
        assert_ne!(first.message_id, other.message_id);
    }

    #[test]
    fn body_text_is_trimmed_and_truncated_by_chars() {
        let fake = message("t@host", "a@example.com", "s", None);
        let body = "  héllo wörld, with a signature  ";
        let parsed = parse_message(&raw(1, &fake.header, Some(body)), 5).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("héllo"));
    }

    #[test]
    fn blank_body_yields_no_text() {
        let fake = message("t@host", "a@example.com", "s", None);
        let parsed = parse_message(&raw(1, &fake.header, Some("  \r\n ")), 100).unwrap();
        assert!(parsed.text.is_none());
    }

    #[test]
    fn empty_header_is_skipped() {
        assert!(parse_message(&raw(1, "", Some("text")), 100).is_none());
    }

    #[test]
    fn signature_sentinel_wire_shape() {
        let end = SignatureMessage::End {
            mining_id: TaskId::from("t1"),
        };
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            serde_json::json!({"type": "end", "miningId": "t1"})
        );
    }
}
