//! Back-end wire protocol.
//!
//! Every text frame is a JSON object. Outbound messages carry an `action`
//! discriminator, inbound messages a `type` discriminator.
//!
//! Client actions (sent to the back-end):
//! - start_session - open a fresh conversation (`input_type`, `new_session`)
//! - end_session - close the conversation
//! - ping - keepalive
//! - stream_data - submit one prompt (`input_type`, `data`)
//!
//! Server messages (received from the back-end):
//! - session_started - the conversation is ready for input
//! - gemini_response - a chunk of reply text (`text`)
//! - system - system notice; `data == "turn end"` closes the reply
//! - audio_chunk - a new speech stream starts (`speech_id`); binary frames
//!   that follow belong to it

use serde::{Deserialize, Serialize};

/// Input modality declared for every text submission.
pub const TEXT_INPUT_TYPE: &str = "text";

/// Payload of the `system` message that marks the end of a reply.
pub const TURN_END_MARKER: &str = "turn end";

/// Messages sent to the back-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    /// Open a conversation
    StartSession {
        /// Input modality
        input_type: String,
        /// Request a fresh conversation instead of resuming one
        new_session: bool,
    },

    /// Close the conversation
    EndSession,

    /// Keepalive
    Ping,

    /// Submit streamed input
    StreamData {
        /// Input modality
        input_type: String,
        /// Prompt text
        data: String,
    },
}

impl ClientAction {
    /// Handshake request for a fresh text conversation.
    pub fn start_text_session() -> Self {
        Self::StartSession {
            input_type: TEXT_INPUT_TYPE.to_string(),
            new_session: true,
        }
    }

    /// Text prompt submission.
    pub fn text_prompt(prompt: impl Into<String>) -> Self {
        Self::StreamData {
            input_type: TEXT_INPUT_TYPE.to_string(),
            data: prompt.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages received from the back-end.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Conversation is ready
    SessionStarted,

    /// Reply text chunk
    GeminiResponse {
        #[serde(default)]
        text: String,
    },

    /// System notice
    System {
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Start of a speech stream
    AudioChunk {
        #[serde(default)]
        speech_id: serde_json::Value,
    },

    /// Any message type this bridge does not act on
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse one text frame. Returns `None` for frames that are not valid JSON
    /// objects with a `type` field.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Whether this is the `system` notice closing a reply.
    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::System { data } if data.as_str() == Some(TURN_END_MARKER))
    }
}

/// Normalize a wire `speech_id` to a generation token.
///
/// The back-end sends strings, but numeric ids are accepted too. Null, empty
/// strings and other JSON types yield `None`.
pub fn speech_id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
