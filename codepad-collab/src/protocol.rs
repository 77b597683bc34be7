//! JSON wire protocol for collaboration frames.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! { "type":    "cursor" | "selection" | "edit",
//!   "userId":  "<sender id>",
//!   "payload": <kind-specific object> }
//! ```
//!
//! Positions and ranges use the editor's 1-based `lineNumber`/`column`
//! naming so frames can be handed to the editing surface untouched.
//! The codec is stateless: [`encode`] and [`decode`] are free functions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{CodecError, DecodeError};

// ───────────────────────────────────────────────────────────────────
// Payload types
// ───────────────────────────────────────────────────────────────────

/// A caret position in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub line_number: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line_number: u32, column: u32) -> Self {
        Self { line_number, column }
    }
}

/// A text range, start inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self {
            start_line_number: start.line_number,
            start_column: start.column,
            end_line_number: end.line_number,
            end_column: end.column,
        }
    }

    pub fn start(&self) -> Position {
        Position::new(self.start_line_number, self.start_column)
    }

    pub fn end(&self) -> Position {
        Position::new(self.end_line_number, self.end_column)
    }

    pub fn is_empty(&self) -> bool {
        self.start() == self.end()
    }
}

/// One replacement inside an edit. `text` replaces the contents of `range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub range: Range,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPayload {
    pub selection: Range,
}

/// Ordered edit operations, applied left to right by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPayload {
    pub changes: Vec<TextChange>,
}

// ───────────────────────────────────────────────────────────────────
// Message
// ───────────────────────────────────────────────────────────────────

/// Message kinds carried in the `type` field.
///
/// Subscriptions are keyed by kind, and a frame's kind always matches the
/// shape of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Caret moved.
    Cursor,
    /// Selection changed.
    Selection,
    /// Text edited.
    Edit,
}

impl MessageKind {
    /// Every kind this client understands, in wire-tag order.
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Cursor,
        MessageKind::Selection,
        MessageKind::Edit,
    ];

    /// Wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Cursor => "cursor",
            MessageKind::Selection => "selection",
            MessageKind::Edit => "edit",
        }
    }

    /// Parse a wire tag. Returns `None` for kinds this client does not know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "cursor" => Some(MessageKind::Cursor),
            "selection" => Some(MessageKind::Selection),
            "edit" => Some(MessageKind::Edit),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload. The variant is the tag, so a payload can never
/// disagree with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Cursor(CursorPayload),
    Selection(SelectionPayload),
    Edit(EditPayload),
}

impl Payload {
    pub fn cursor(position: Position) -> Self {
        Payload::Cursor(CursorPayload { position })
    }

    pub fn selection(selection: Range) -> Self {
        Payload::Selection(SelectionPayload { selection })
    }

    pub fn edit(changes: Vec<TextChange>) -> Self {
        Payload::Edit(EditPayload { changes })
    }

    /// The kind is derived from the variant, never stored separately.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Cursor(_) => MessageKind::Cursor,
            Payload::Selection(_) => MessageKind::Selection,
            Payload::Edit(_) => MessageKind::Edit,
        }
    }
}

/// A decoded collaboration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `userId` of the editor that sent the frame.
    pub sender_id: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(sender_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn as_cursor(&self) -> Option<&CursorPayload> {
        match &self.payload {
            Payload::Cursor(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_selection(&self) -> Option<&SelectionPayload> {
        match &self.payload {
            Payload::Selection(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_edit(&self) -> Option<&EditPayload> {
        match &self.payload {
            Payload::Edit(p) => Some(p),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Codec
// ───────────────────────────────────────────────────────────────────

/// Wire envelope for encoding; borrows so sends do not clone the payload.
#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(rename = "userId")]
    user_id: &'a str,
    payload: &'a Payload,
}

/// Wire envelope for decoding. The tag stays a string so unknown kinds can
/// be told apart from malformed frames.
#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "userId")]
    user_id: String,
    payload: Value,
}

/// Serialize a payload from `sender_id` into a wire frame.
pub fn encode(sender_id: &str, payload: &Payload) -> Result<String, CodecError> {
    let frame = OutboundFrame {
        kind: payload.kind(),
        user_id: sender_id,
        payload,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Parse and validate a wire frame.
///
/// The envelope is checked first, then the tag, then the payload shape for
/// that tag. Unknown tags produce [`DecodeError::UnknownKind`] so callers can
/// drop them quietly.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let frame: InboundFrame = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

    let kind = MessageKind::from_tag(&frame.kind)
        .ok_or_else(|| DecodeError::UnknownKind(frame.kind.clone()))?;

    let invalid = |source| DecodeError::InvalidPayload { kind, source };
    let payload = match kind {
        MessageKind::Cursor => {
            Payload::Cursor(serde_json::from_value(frame.payload).map_err(invalid)?)
        }
        MessageKind::Selection => {
            Payload::Selection(serde_json::from_value(frame.payload).map_err(invalid)?)
        }
        MessageKind::Edit => Payload::Edit(serde_json::from_value(frame.payload).map_err(invalid)?),
    };

    Ok(Message {
        sender_id: frame.user_id,
        payload,
    })
}
