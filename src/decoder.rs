//! Message decoder — raw RFC 5322 bytes to a `{subject, body}` pair.
//!
//! Decoding is total: any failure degrades to empty fields and is logged,
//! never propagated.

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DecodeError;
use crate::mailbox::RawMessage;

/// Channel-agnostic view of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub subject: String,
    pub body: String,
}

impl NormalizedMessage {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Decode a fetched message. Never fails.
pub fn decode(raw: &RawMessage) -> NormalizedMessage {
    let Some(parsed) = MessageParser::default().parse(raw.content.as_slice()) else {
        warn!(id = %raw.id, error = %DecodeError::Unparseable, "Failed to decode message");
        return NormalizedMessage::default();
    };

    let subject = parsed.subject().unwrap_or_default().to_string();
    let body = match decode_body(&parsed) {
        Ok(body) => body,
        Err(e) => {
            warn!(id = %raw.id, error = %e, "Failed to extract message body");
            String::new()
        }
    };

    NormalizedMessage { subject, body }
}

/// Pick the body text.
///
/// Multipart: the first leaf `text/plain` part without a
/// `Content-Disposition`. Otherwise (or if none qualifies) the root
/// payload as UTF-8.
pub fn decode_body(message: &Message<'_>) -> Result<String, DecodeError> {
    let root = message.parts.first().ok_or(DecodeError::MissingPayload)?;

    if matches!(root.body, PartType::Multipart(_))
        && let Some(part) = message.parts.iter().skip(1).find(|p| is_inline_plain_text(p))
    {
        return payload_as_utf8(part);
    }

    payload_as_utf8(root)
}

fn is_inline_plain_text(part: &MessagePart<'_>) -> bool {
    if matches!(part.body, PartType::Multipart(_) | PartType::Message(_)) {
        return false;
    }
    if part.content_disposition().is_some() {
        return false;
    }
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct
                    .subtype()
                    .is_some_and(|sub| sub.eq_ignore_ascii_case("plain"))
        }
        // RFC 2045 default
        None => true,
    }
}

fn payload_as_utf8(part: &MessagePart<'_>) -> Result<String, DecodeError> {
    if matches!(part.body, PartType::Multipart(_)) {
        return Err(DecodeError::MissingPayload);
    }
    if let Some(text) = part.text_contents() {
        return Ok(text.to_string());
    }
    Ok(std::str::from_utf8(part.contents())?.to_string())
}
