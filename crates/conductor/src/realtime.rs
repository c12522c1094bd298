//! Envelopes exchanged with a realtime bridge.
//!
//! The bridge owns the socket and any audio session; the agent only consumes `message`
//! and `abort` envelopes and answers with `message`, `usage` and `error` envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::message::Message;
use crate::providers::base::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEnvelope {
    #[serde(rename = "message")]
    Message(Message),
    #[serde(rename = "audio.chunk")]
    AudioChunk(AudioChunk),
    #[serde(rename = "audio.commit")]
    AudioCommit,
    #[serde(rename = "config")]
    Config(Value),
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "usage")]
    Usage(Usage),
    #[serde(rename = "error")]
    Error(EnvelopeError),
}

impl RealtimeEnvelope {
    pub fn error<S: Into<String>>(message: S) -> Self {
        RealtimeEnvelope::Error(EnvelopeError {
            message: message.into(),
        })
    }

    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEnvelope::Message(_) => "message",
            RealtimeEnvelope::AudioChunk(_) => "audio.chunk",
            RealtimeEnvelope::AudioCommit => "audio.commit",
            RealtimeEnvelope::Config(_) => "config",
            RealtimeEnvelope::Abort => "abort",
            RealtimeEnvelope::Usage(_) => "usage",
            RealtimeEnvelope::Error(_) => "error",
        }
    }
}

/// Base64 encoded audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub audio: String,
}

impl AudioChunk {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            audio: STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.audio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = RealtimeEnvelope::Usage(Usage::new(3, 4));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "usage");
        assert_eq!(value["data"]["input_tokens"], 3);

        let abort: RealtimeEnvelope = serde_json::from_value(json!({"type": "abort"})).unwrap();
        assert_eq!(abort, RealtimeEnvelope::Abort);
        assert_eq!(abort.kind(), "abort");
    }

    #[test]
    fn test_message_envelope_from_bridge() {
        let envelope: RealtimeEnvelope = serde_json::from_value(json!({
            "type": "message",
            "data": {
                "role": "user",
                "created": 0,
                "content": [{"type": "text", "text": "hello"}]
            }
        }))
        .unwrap();

        match envelope {
            RealtimeEnvelope::Message(message) => assert_eq!(message.text(), "hello"),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_audio_chunk_base64() {
        let chunk = AudioChunk::from_bytes(&[0, 1, 2, 255]);
        assert_eq!(chunk.audio, "AAEC/w==");
        assert_eq!(chunk.decode().unwrap(), vec![0, 1, 2, 255]);

        let envelope: RealtimeEnvelope = serde_json::from_value(json!({
            "type": "audio.chunk",
            "data": {"audio": "AAEC/w=="}
        }))
        .unwrap();
        assert_eq!(envelope, RealtimeEnvelope::AudioChunk(chunk));

        assert!(AudioChunk {
            audio: "%%%".to_string()
        }
        .decode()
        .is_err());
    }
}
