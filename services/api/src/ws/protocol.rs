//! Wire formats for the two streaming legs of the bridge.
//!
//! Both protocols are JSON text frames. Message kinds are modeled as tagged
//! enums with an explicit `Unknown` catch-all so new provider message types
//! degrade to a logged no-op instead of a parse failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Telephony leg (media-stream protocol)
// ---------------------------------------------------------------------------

/// Frames received from the telephony provider's media stream.
#[derive(Deserialize, Debug)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyFrame {
    /// Stream metadata; arrives once, before any media.
    Start { start: StreamStart },
    /// One chunk of caller audio.
    Media { media: MediaPayload },
    /// The provider is closing the stream.
    Stop,
    /// Anything else (e.g. the initial `connected` handshake frame).
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StreamStart {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
    /// Parameters embedded in the call-instruction markup (custom prompt and
    /// greeting, when configured).
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Base64 audio chunk, carried verbatim in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    pub payload: String,
}

/// Frames sent back to the telephony provider.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyOut {
    /// Agent audio for the caller, tied to the session's stream id.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    /// Flush queued agent audio immediately (barge-in).
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

// ---------------------------------------------------------------------------
// Voice-AI leg (conversational agent protocol)
// ---------------------------------------------------------------------------

/// Messages received from the conversational-voice provider.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: Option<ConversationMetadata>,
    },
    /// Synthesized agent audio to play to the caller.
    Audio { audio_event: AudioEvent },
    /// The caller started speaking over the agent.
    Interruption,
    /// Keepalive; must be answered with a pong carrying the same event id.
    Ping { ping_event: PingEvent },
    /// The caller's speech, transcribed.
    UserTranscript {
        user_transcription_event: UserTranscriptionEvent,
    },
    /// The agent's reply text.
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    /// The agent is still thinking; carries nothing actionable.
    InternalTentativeAgentResponse,
    /// Provider-side error, often transient.
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ConversationMetadata {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AudioEvent {
    pub audio_base_64: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PingEvent {
    pub event_id: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserTranscriptionEvent {
    #[serde(default)]
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentResponseEvent {
    #[serde(default)]
    pub agent_response: String,
}

/// Session-initiation message sent right after the outbound leg connects.
///
/// Deliberately minimal: the provider's preconfigured agent persona governs
/// the conversation (override fields trigger a policy rejection).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionInit {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl Default for SessionInit {
    fn default() -> Self {
        Self {
            kind: "conversation_initiation_client_data",
        }
    }
}

/// Caller audio forwarded to the agent. This message is untagged on the wire.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UserAudioChunk {
    pub user_audio_chunk: String,
}

/// Keepalive reply; echoes the ping's event id.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Pong {
    #[serde(rename = "type")]
    kind: &'static str,
    pub event_id: i64,
}

impl Pong {
    pub fn new(event_id: i64) -> Self {
        Self {
            kind: "pong",
            event_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_frame_with_custom_parameters() {
        let raw = json!({
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC_test",
                "streamSid": "MZ0123",
                "callSid": "CA0456",
                "customParameters": {
                    "prompt": "stress management",
                    "first_message": "Hi there!"
                }
            },
            "streamSid": "MZ0123"
        })
        .to_string();

        match serde_json::from_str::<TelephonyFrame>(&raw).unwrap() {
            TelephonyFrame::Start { start } => {
                assert_eq!(start.stream_sid, "MZ0123");
                assert_eq!(start.call_sid, "CA0456");
                assert_eq!(
                    start.custom_parameters.get("prompt").map(String::as_str),
                    Some("stress management")
                );
            }
            other => panic!("expected start frame, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_and_stop_frames() {
        let media: TelephonyFrame = serde_json::from_str(
            r#"{"event": "media", "streamSid": "MZ0123", "media": {"track": "inbound", "payload": "bXVsYXc="}}"#,
        )
        .unwrap();
        match media {
            TelephonyFrame::Media { media } => assert_eq!(media.payload, "bXVsYXc="),
            other => panic!("expected media frame, got {other:?}"),
        }

        let stop: TelephonyFrame =
            serde_json::from_str(r#"{"event": "stop", "streamSid": "MZ0123"}"#).unwrap();
        assert!(matches!(stop, TelephonyFrame::Stop));
    }

    #[test]
    fn handshake_frame_degrades_to_unknown() {
        let frame: TelephonyFrame =
            serde_json::from_str(r#"{"event": "connected", "protocol": "Call"}"#).unwrap();
        assert!(matches!(frame, TelephonyFrame::Unknown));
    }

    #[test]
    fn serializes_media_frame_for_telephony() {
        let frame = TelephonyOut::Media {
            stream_sid: "MZ0123".into(),
            media: MediaPayload {
                payload: "bXVsYXc=".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": "media", "streamSid": "MZ0123", "media": {"payload": "bXVsYXc="}})
        );
    }

    #[test]
    fn serializes_clear_frame_without_payload() {
        let frame = TelephonyOut::Clear {
            stream_sid: "MZ0123".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": "clear", "streamSid": "MZ0123"})
        );
    }

    #[test]
    fn parses_agent_audio_and_ping() {
        let audio: AgentMessage = serde_json::from_str(
            r#"{"type": "audio", "audio_event": {"audio_base_64": "cGNt", "event_id": 7}}"#,
        )
        .unwrap();
        match audio {
            AgentMessage::Audio { audio_event } => assert_eq!(audio_event.audio_base_64, "cGNt"),
            other => panic!("expected audio, got {other:?}"),
        }

        let ping: AgentMessage =
            serde_json::from_str(r#"{"type": "ping", "ping_event": {"event_id": 42, "ping_ms": 15}}"#)
                .unwrap();
        match ping {
            AgentMessage::Ping { ping_event } => assert_eq!(ping_event.event_id, 42),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn parses_transcript_events() {
        let user: AgentMessage = serde_json::from_str(
            r#"{"type": "user_transcript", "user_transcription_event": {"user_transcript": "I feel great today"}}"#,
        )
        .unwrap();
        match user {
            AgentMessage::UserTranscript {
                user_transcription_event,
            } => assert_eq!(user_transcription_event.user_transcript, "I feel great today"),
            other => panic!("expected user transcript, got {other:?}"),
        }

        let agent: AgentMessage = serde_json::from_str(
            r#"{"type": "agent_response", "agent_response_event": {"agent_response": "Glad to hear it."}}"#,
        )
        .unwrap();
        match agent {
            AgentMessage::AgentResponse {
                agent_response_event,
            } => assert_eq!(agent_response_event.agent_response, "Glad to hear it."),
            other => panic!("expected agent response, got {other:?}"),
        }
    }

    #[test]
    fn interruption_and_tentative_parse_as_units() {
        let interruption: AgentMessage = serde_json::from_str(
            r#"{"type": "interruption", "interruption_event": {"event_id": 3}}"#,
        )
        .unwrap();
        assert!(matches!(interruption, AgentMessage::Interruption));

        let tentative: AgentMessage = serde_json::from_str(
            r#"{"type": "internal_tentative_agent_response", "tentative_agent_response_internal_event": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            tentative,
            AgentMessage::InternalTentativeAgentResponse
        ));
    }

    #[test]
    fn novel_agent_message_types_degrade_to_unknown() {
        let msg: AgentMessage =
            serde_json::from_str(r#"{"type": "vad_score", "vad_score_event": {"score": 0.9}}"#)
                .unwrap();
        assert!(matches!(msg, AgentMessage::Unknown));
    }

    #[test]
    fn session_init_is_minimal() {
        assert_eq!(
            serde_json::to_value(SessionInit::default()).unwrap(),
            json!({"type": "conversation_initiation_client_data"})
        );
    }

    #[test]
    fn pong_echoes_event_id() {
        assert_eq!(
            serde_json::to_value(Pong::new(42)).unwrap(),
            json!({"type": "pong", "event_id": 42})
        );
    }

    #[test]
    fn user_audio_chunk_is_untagged() {
        let chunk = UserAudioChunk {
            user_audio_chunk: "bXVsYXc=".into(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"user_audio_chunk": "bXVsYXc="})
        );
    }
}
