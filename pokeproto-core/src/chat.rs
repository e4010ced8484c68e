//! Chat message construction and the sticker-payload boundary. Grounded on
//! `original_source/protocol/chat.py`, whose base64 sticker encoding and
//! message-builder shape this keeps, while its validation/persistence
//! stays external to the core (spec.md §1).

use crate::codec::{Fields, MESSAGE_TYPE_KEY};

pub const CHAT_MESSAGE_TYPE: &str = "CHAT_MESSAGE";

/// Sticker payloads above this size risk IP fragmentation once base64
/// overhead and the rest of the datagram's fields are added on top of the
/// transport's ~65507-byte ceiling. This is a warning threshold, not a
/// hard limit — the decision to reject an oversized sticker belongs to the
/// external [`StickerPolicy`].
pub const CHAT_FRAGMENTATION_WARN_BYTES: usize = 1500;

/// Chat payload kind, mirrors `content_type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatContentType {
    Text,
    Sticker,
}

impl ChatContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatContentType::Text => "TEXT",
            ChatContentType::Sticker => "STICKER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TEXT" => Some(ChatContentType::Text),
            "STICKER" => Some(ChatContentType::Sticker),
            _ => None,
        }
    }
}

/// Builds a `CHAT_MESSAGE {sender_name, content_type: TEXT, message_text}`
/// field mapping, ready to be handed to the reliability layer for
/// sequencing and send.
pub fn make_text_message(sender_name: &str, message_text: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(MESSAGE_TYPE_KEY.to_string(), CHAT_MESSAGE_TYPE.to_string());
    fields.insert("sender_name".to_string(), sender_name.to_string());
    fields.insert("content_type".to_string(), ChatContentType::Text.as_str().to_string());
    fields.insert("message_text".to_string(), message_text.to_string());
    fields
}

/// Builds a `CHAT_MESSAGE {sender_name, content_type: STICKER,
/// sticker_data}` field mapping. `sticker_data` must already be
/// base64-encoded; the core never decodes or validates it (that's the
/// external sticker handler's job, spec.md §1).
pub fn make_sticker_message(sender_name: &str, sticker_data_base64: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(MESSAGE_TYPE_KEY.to_string(), CHAT_MESSAGE_TYPE.to_string());
    fields.insert("sender_name".to_string(), sender_name.to_string());
    fields.insert("content_type".to_string(), ChatContentType::Sticker.as_str().to_string());
    fields.insert("sticker_data".to_string(), sticker_data_base64.to_string());
    fields
}

/// A parsed inbound chat message, handed to whatever external policy
/// decides how to display or persist it.
pub struct ChatMessage {
    pub sender_name: String,
    pub content_type: ChatContentType,
    pub message_text: Option<String>,
    pub sticker_data: Option<String>,
}

pub fn parse_chat_message(fields: &Fields) -> Option<ChatMessage> {
    let sender_name = fields.get("sender_name")?.clone();
    let content_type = ChatContentType::parse(fields.get("content_type")?)?;
    Some(ChatMessage {
        sender_name,
        content_type,
        message_text: fields.get("message_text").cloned(),
        sticker_data: fields.get("sticker_data").cloned(),
    })
}

/// External collaborator that validates and persists sticker payloads.
/// The core only needs to know whether a sticker is acceptable to relay;
/// decoding, on-disk caching and cleanup are out of scope (spec.md §1).
pub trait StickerPolicy: Send + Sync {
    fn accept(&self, sender_name: &str, sticker_data_base64: &str) -> bool;
}

/// Accepts every sticker unconditionally — useful for tests and as the
/// default when no policy is supplied.
pub struct NoOpStickerPolicy;

impl StickerPolicy for NoOpStickerPolicy {
    fn accept(&self, _sender_name: &str, _sticker_data_base64: &str) -> bool {
        true
    }
}
