//! Newline-delimited `key: value` text framing, one message per datagram.
//!
//! Grounded on `original_source/protocol/message.py`'s `Message.serialize`
//! / `Message.deserialize`, generalized into free functions operating on a
//! plain field mapping (spec.md §4.2's "the codec produces a field
//! mapping").

use crate::error::CodecError;
use std::collections::HashMap;

/// A decoded (or to-be-encoded) message: every field including
/// `message_type`, `sequence_number` and `ack_number` when present.
pub type Fields = HashMap<String, String>;

pub const MESSAGE_TYPE_KEY: &str = "message_type";
pub const SEQUENCE_NUMBER_KEY: &str = "sequence_number";
pub const ACK_NUMBER_KEY: &str = "ack_number";

/// Encode a field mapping into wire bytes.
///
/// `message_type` is always written first for readability; the remaining
/// keys are sorted so encoding is deterministic (the wire format itself
/// does not require any particular order — spec.md §6). Embedded newlines
/// in a value are replaced with spaces, since a value may not span lines.
pub fn encode_message(fields: &Fields) -> Vec<u8> {
    let mut lines = Vec::with_capacity(fields.len());

    if let Some(message_type) = fields.get(MESSAGE_TYPE_KEY) {
        lines.push(format!("{MESSAGE_TYPE_KEY}: {}", sanitize_value(message_type)));
    }

    let mut rest: Vec<&String> = fields
        .keys()
        .filter(|k| k.as_str() != MESSAGE_TYPE_KEY)
        .collect();
    rest.sort();

    for key in rest {
        let value = &fields[key];
        lines.push(format!("{key}: {}", sanitize_value(value)));
    }

    lines.join("\n").into_bytes()
}

fn sanitize_value(value: &str) -> String {
    value.replace('\n', " ")
}

/// Decode wire bytes into a field mapping.
///
/// Lines are `\n`-separated; each non-empty line is `key: value` or the
/// permissive `key:value` (no space). Blank lines are skipped. A line with
/// no colon is a parse error — the whole datagram is rejected, matching
/// spec.md §4.2 ("on malformed lines the decoder fails with a parse
/// error").
pub fn decode_message(data: &[u8]) -> Result<Fields, CodecError> {
    let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8)?;
    let mut fields = Fields::new();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let colon = line
            .find(':')
            .ok_or_else(|| CodecError::MalformedLine(line.to_string()))?;
        let key = line[..colon].trim();
        if key.is_empty() || key.contains(':') {
            return Err(CodecError::MalformedLine(line.to_string()));
        }
        // Permissive: "key: value" (space after colon) or "key:value".
        let rest = &line[colon + 1..];
        let value = rest.strip_prefix(' ').unwrap_or(rest);

        fields.insert(key.to_string(), value.to_string());
    }

    if !fields.contains_key(MESSAGE_TYPE_KEY) {
        return Err(CodecError::MissingMessageType);
    }

    Ok(fields)
}

/// Given a decoded mapping and a list of required keys, returns whether all
/// are present and, if not, the first missing key.
pub fn require_fields(fields: &Fields, required: &[&str]) -> (bool, Option<String>) {
    for key in required {
        if !fields.contains_key(*key) {
            return (false, Some((*key).to_string()));
        }
    }
    (true, None)
}

/// Parse a decimal integer field, producing a [`CodecError::InvalidInt`] on
/// failure so callers can log/drop consistently.
pub fn parse_int_field(fields: &Fields, key: &str) -> Result<i64, CodecError> {
    let value = fields
        .get(key)
        .ok_or_else(|| CodecError::InvalidInt {
            field: key.to_string(),
            value: String::new(),
        })?;
    value.parse::<i64>().map_err(|_| CodecError::InvalidInt {
        field: key.to_string(),
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip_simple_message() {
        let original = fields(&[
            ("message_type", "ATTACK_ANNOUNCE"),
            ("move_name", "Ember"),
            ("sequence_number", "7"),
        ]);
        let encoded = encode_message(&original);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn permissive_no_space_after_colon() {
        let decoded = decode_message(b"message_type:ACK\nack_number:3").unwrap();
        assert_eq!(decoded.get("message_type").unwrap(), "ACK");
        assert_eq!(decoded.get("ack_number").unwrap(), "3");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let decoded = decode_message(b"message_type: ACK\n\nack_number: 1\n").unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn empty_value_is_permitted() {
        let decoded = decode_message(b"message_type: CHAT_MESSAGE\nmessage_text: ").unwrap();
        assert_eq!(decoded.get("message_text").unwrap(), "");
    }

    #[test]
    fn malformed_line_without_colon_is_rejected() {
        let err = decode_message(b"message_type: ACK\ngarbage_line_no_colon").unwrap_err();
        assert_eq!(err, CodecError::MalformedLine("garbage_line_no_colon".into()));
    }

    #[test]
    fn missing_message_type_is_rejected() {
        let err = decode_message(b"move_name: Ember").unwrap_err();
        assert_eq!(err, CodecError::MissingMessageType);
    }

    #[test]
    fn require_fields_reports_first_missing() {
        let msg = fields(&[("message_type", "BATTLE_SETUP"), ("pokemon_name", "Squirtle")]);
        let (ok, missing) = require_fields(&msg, &["pokemon_name", "pokemon"]);
        assert!(!ok);
        assert_eq!(missing.as_deref(), Some("pokemon"));
    }

    #[test]
    fn nested_json_value_passes_through_as_string() {
        let msg = fields(&[
            ("message_type", "BATTLE_SETUP"),
            ("pokemon", r#"{"name":"Pikachu"}"#),
        ]);
        let encoded = encode_message(&msg);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.get("pokemon").unwrap(), r#"{"name":"Pikachu"}"#);
    }

    #[test]
    fn embedded_newline_in_value_is_flattened_on_encode() {
        let msg = fields(&[("message_type", "CHAT_MESSAGE"), ("message_text", "hi\nthere")]);
        let encoded = String::from_utf8(encode_message(&msg)).unwrap();
        assert!(!encoded.contains("hi\nthere"));
        assert!(encoded.contains("hi there"));
    }
}
