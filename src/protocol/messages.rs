//! # Wire Messages
//!
//! JSON text frames exchanged with the server.
//!
//! ## Client → Server:
//! - `{"type":"settings","settings":{...}}`, once, as the first frame
//! - `{"mime_type":"audio/pcm","data":"<base64 PCM16 16kHz>"}`
//!
//! ## Server → Client:
//! Frames are not uniformly tagged, so they are matched by shape:
//! - `{"type":"context_updated","context_dict":{...}}`
//! - `{"turn_complete":true}` / `{"interrupted":true}`
//! - `{"mime_type":"audio/pcm","data":"..."}` (24kHz PCM16)
//! - `{"mime_type":"text/plain","data":"..."}` (agent text)
//! - `{"input_transcription":{"text":"..."}}` / `{"output_transcription":{...}}`
//! - `{"type":"system"|"error","message":"..."}`
//!
//! Control frames (context, turn complete, interrupted) are exclusive. An
//! audio frame may also carry transcription fields, in which case one frame
//! yields several messages, in the order listed above.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};

pub const MIME_AUDIO_PCM: &str = "audio/pcm";
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Who produced a piece of transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    /// Markdown header that starts a block of this role's text.
    pub fn header(&self) -> &'static str {
        match self {
            Role::User => "**You:**",
            Role::Agent => "**Agent:**",
        }
    }
}

/// One decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Base64 PCM16 at the playback rate, passed through undecoded
    AudioFrame(String),
    TranscriptDelta {
        role: Role,
        text: String,
        is_final: bool,
    },
    TurnComplete,
    Interrupted,
    ContextUpdate(Map<String, Value>),
    SystemNotice(String),
    /// Valid JSON with no recognized shape
    Unknown,
}

impl InboundMessage {
    /// Short name for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::AudioFrame(_) => "audio_frame",
            InboundMessage::TranscriptDelta { .. } => "transcript_delta",
            InboundMessage::TurnComplete => "turn_complete",
            InboundMessage::Interrupted => "interrupted",
            InboundMessage::ContextUpdate(_) => "context_update",
            InboundMessage::SystemNotice(_) => "system_notice",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// Top-level fields we look at. Everything is optional and loosely typed so
/// that any JSON object deserializes.
#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    context_dict: Option<Value>,
    turn_complete: Option<Value>,
    interrupted: Option<Value>,
    mime_type: Option<String>,
    data: Option<Value>,
    input_transcription: Option<Value>,
    output_transcription: Option<Value>,
    message: Option<Value>,
}

/// Parse one text frame.
///
/// ## Errors:
/// - `AppError::Decode` when the frame is not JSON
/// - `AppError::ProtocolViolation` when it is JSON but not an object
pub fn parse_frame(text: &str) -> AppResult<Vec<InboundMessage>> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(AppError::ProtocolViolation(format!(
            "Expected a JSON object, got {}",
            json_type(&value)
        )));
    }
    Ok(classify(value))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Map a decoded JSON object onto the messages it carries.
fn classify(value: Value) -> Vec<InboundMessage> {
    let frame: RawFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(_) => return vec![InboundMessage::Unknown],
    };

    if frame.kind.as_deref() == Some("context_updated") {
        let context = match frame.context_dict {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        return vec![InboundMessage::ContextUpdate(context)];
    }
    if is_truthy(frame.turn_complete.as_ref()) {
        return vec![InboundMessage::TurnComplete];
    }
    if is_truthy(frame.interrupted.as_ref()) {
        return vec![InboundMessage::Interrupted];
    }

    let mut messages = Vec::new();
    let data = frame.data.as_ref().and_then(Value::as_str).filter(|d| !d.is_empty());

    match (frame.mime_type.as_deref(), data) {
        (Some(MIME_AUDIO_PCM), Some(data)) => {
            messages.push(InboundMessage::AudioFrame(data.to_string()));
        }
        (Some(MIME_TEXT_PLAIN), Some(data)) => {
            messages.push(InboundMessage::TranscriptDelta {
                role: Role::Agent,
                text: data.to_string(),
                is_final: false,
            });
        }
        _ => {}
    }

    if let Some(delta) = transcription(frame.input_transcription.as_ref(), Role::User) {
        messages.push(delta);
    }
    if let Some(delta) = transcription(frame.output_transcription.as_ref(), Role::Agent) {
        messages.push(delta);
    }

    if messages.is_empty() {
        if let (Some("system" | "error"), Some(text)) =
            (frame.kind.as_deref(), frame.message.as_ref().and_then(Value::as_str))
        {
            messages.push(InboundMessage::SystemNotice(text.to_string()));
        }
    }

    if messages.is_empty() {
        messages.push(InboundMessage::Unknown);
    }
    messages
}

fn transcription(value: Option<&Value>, role: Role) -> Option<InboundMessage> {
    let object = value?.as_object()?;
    let text = object.get("text")?.as_str()?;
    let is_final = object.get("finished").and_then(Value::as_bool).unwrap_or(false);
    Some(InboundMessage::TranscriptDelta {
        role,
        text: text.to_string(),
        is_final,
    })
}

/// Loose truthiness: `true`, non-zero numbers and non-empty strings count.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        Some(Value::Null) | None => false,
    }
}

/// Outbound audio frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundAudio {
    pub mime_type: String,
    pub data: String,
}

impl OutboundAudio {
    /// A PCM16 frame carrying Base64 `data`.
    pub fn pcm(data: String) -> Self {
        Self {
            mime_type: MIME_AUDIO_PCM.to_string(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        json!({ "mime_type": self.mime_type, "data": self.data }).to_string()
    }
}

/// The session-initialization frame sent when the socket opens.
pub fn settings_frame(settings: &Value) -> String {
    json!({ "type": "settings", "settings": settings }).to_string()
}
