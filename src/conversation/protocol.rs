//! Inbound frame protocol.
//!
//! Clients send JSON text frames with a `type` discriminator:
//!
//! ```json
//! {"type": "message", "text": "Hello there"}
//! {"type": "ready_for_next"}
//! ```
//!
//! Anything else is still turned into a [`Signal`] so the pipeline can answer with
//! a text error frame instead of dropping the connection.

use serde::Deserialize;
use serde_json::Value;

/// Sent while a message is in flight and a new one is queued behind it.
pub const WAIT_NOTICE: &str = "Please wait until current audio finishes.";

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// New user input. Not validated here.
    Submit(String),
    /// The client has finished playing the previous audio.
    ReadyForNext,
    /// Well-formed JSON with an unknown or missing `type`.
    Unrecognized(String),
    /// Not JSON, not an object, or a known `type` with a bad payload.
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Message {
        #[serde(default)]
        text: String,
    },
    ReadyForNext,
}

const KNOWN_TYPES: [&str; 2] = ["message", "ready_for_next"];

/// Decode a text frame into a pipeline signal.
pub fn parse_frame(raw: &str) -> Signal {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return Signal::Malformed(err.to_string()),
    };

    if !value.is_object() {
        return Signal::Malformed("expected a JSON object".to_string());
    }

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => "<missing>".to_string(),
    };

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Message { text }) => Signal::Submit(text),
        Ok(ClientMessage::ReadyForNext) => Signal::ReadyForNext,
        Err(err) if KNOWN_TYPES.contains(&kind.as_str()) => Signal::Malformed(err.to_string()),
        Err(_) => Signal::Unrecognized(kind),
    }
}
