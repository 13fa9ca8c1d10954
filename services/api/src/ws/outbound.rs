//! The outbound voice-AI leg of a bridge session.
//!
//! Each live session owns one task spawned here. The task holds the provider
//! WebSocket, forwards caller audio handed over from the inbound loop, and
//! translates provider messages into telephony frames and session events.
//! Provider messages are processed strictly in arrival order, which is what
//! guarantees a `clear` frame reaches the telephony leg before any audio of
//! the agent's next turn.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::ws::protocol::{
    AgentMessage, MediaPayload, Pong, SessionInit, TelephonyOut, UserAudioChunk,
};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands the inbound loop sends to the outbound leg.
#[derive(Debug)]
pub enum OutboundCommand {
    /// One base64 caller-audio chunk to forward to the agent.
    Audio(String),
}

/// Events the outbound leg reports back to the session.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    CallerUtterance(String),
    AgentUtterance(String),
    /// The provider closed the leg (keepalive miss, hangup, or error).
    Closed,
}

/// A running outbound leg: the command handle plus the task itself.
pub struct OutboundLeg {
    pub commands: mpsc::Sender<OutboundCommand>,
    pub handle: JoinHandle<()>,
}

/// What one provider message translates into.
#[derive(Debug, PartialEq)]
enum AgentAction {
    ToTelephony(TelephonyOut),
    ToAgent(String),
    Caller(String),
    Agent(String),
}

/// Opens the provider WebSocket with a bounded connect handshake.
///
/// The timeout is fatal for the session's voice leg but must never take the
/// process down; it surfaces as a `Session` error for the caller to log.
pub async fn connect_agent(
    signed_url: &str,
    connect_timeout: Duration,
) -> Result<AgentSocket, CallError> {
    match tokio::time::timeout(connect_timeout, connect_async(signed_url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(CallError::Gateway(format!(
            "voice provider connect failed: {e}"
        ))),
        Err(_) => Err(CallError::Session(format!(
            "voice provider connect timed out after {}s",
            connect_timeout.as_secs()
        ))),
    }
}

/// Sends the session-initiation message and spawns the leg's task.
pub async fn start_leg(
    mut agent_socket: AgentSocket,
    init: SessionInit,
    telephony_tx: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    events: mpsc::Sender<SessionEvent>,
    stream_sid: String,
) -> Result<OutboundLeg, CallError> {
    let init_json = serde_json::to_string(&init)
        .map_err(|e| CallError::Session(format!("init payload serialization: {e}")))?;
    agent_socket
        .send(WsMessage::Text(init_json.into()))
        .await
        .map_err(|e| CallError::Gateway(format!("session init send failed: {e}")))?;
    info!("Voice-AI leg established, session initiated");

    let (cmd_tx, cmd_rx) = mpsc::channel(128);
    let handle = tokio::spawn(run(agent_socket, cmd_rx, events, telephony_tx, stream_sid));

    Ok(OutboundLeg {
        commands: cmd_tx,
        handle,
    })
}

/// The leg's event loop: caller audio out, provider messages in.
async fn run(
    agent_socket: AgentSocket,
    mut cmd_rx: mpsc::Receiver<OutboundCommand>,
    events: mpsc::Sender<SessionEvent>,
    telephony_tx: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    stream_sid: String,
) {
    let (mut agent_tx, mut agent_rx) = agent_socket.split();

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(OutboundCommand::Audio(payload)) => {
                        let chunk = UserAudioChunk { user_audio_chunk: payload };
                        let json = match serde_json::to_string(&chunk) {
                            Ok(json) => json,
                            Err(e) => {
                                // Message loss is preferred over session loss.
                                error!(error = %e, "Dropping unserializable audio chunk");
                                continue;
                            }
                        };
                        if let Err(e) = agent_tx.send(WsMessage::Text(json.into())).await {
                            error!(error = %e, "Voice-AI leg send failed");
                            break;
                        }
                    }
                    None => {
                        info!("Session released the voice-AI leg");
                        break;
                    }
                }
            }
            maybe_msg = agent_rx.next() => {
                match maybe_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let msg = match serde_json::from_str::<AgentMessage>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(error = %e, "Malformed voice-AI message, skipping");
                                continue;
                            }
                        };
                        for action in dispatch(msg, &stream_sid) {
                            match action {
                                AgentAction::ToTelephony(frame) => {
                                    let json = match serde_json::to_string(&frame) {
                                        Ok(json) => json,
                                        Err(e) => {
                                            error!(error = %e, "Dropping unserializable telephony frame");
                                            continue;
                                        }
                                    };
                                    let mut sink = telephony_tx.lock().await;
                                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                                        // The inbound loop observes the dead
                                        // telephony socket and terminates.
                                        warn!(error = %e, "Telephony leg send failed");
                                    }
                                }
                                AgentAction::ToAgent(json) => {
                                    if let Err(e) = agent_tx.send(WsMessage::Text(json.into())).await {
                                        error!(error = %e, "Keepalive reply failed");
                                    }
                                }
                                AgentAction::Caller(text) => {
                                    if events.send(SessionEvent::CallerUtterance(text)).await.is_err() {
                                        return;
                                    }
                                }
                                AgentAction::Agent(text) => {
                                    if events.send(SessionEvent::AgentUtterance(text)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Voice-AI leg closed by provider");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Voice-AI leg receive error");
                        break;
                    }
                }
            }
        }
    }

    let _ = agent_tx.close().await;
    let _ = events.send(SessionEvent::Closed).await;
}

/// Translates one provider message into the actions it requires, in the
/// order they must be executed.
fn dispatch(msg: AgentMessage, stream_sid: &str) -> Vec<AgentAction> {
    match msg {
        AgentMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event,
        } => {
            let conversation_id = conversation_initiation_metadata_event
                .and_then(|event| event.conversation_id);
            info!(?conversation_id, "Voice-AI conversation initiated");
            Vec::new()
        }
        AgentMessage::Audio { audio_event } => vec![AgentAction::ToTelephony(TelephonyOut::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload {
                payload: audio_event.audio_base_64,
            },
        })],
        AgentMessage::Interruption => {
            info!("Caller interrupted, clearing queued agent audio");
            vec![AgentAction::ToTelephony(TelephonyOut::Clear {
                stream_sid: stream_sid.to_string(),
            })]
        }
        AgentMessage::Ping { ping_event } => {
            match serde_json::to_string(&Pong::new(ping_event.event_id)) {
                Ok(json) => vec![AgentAction::ToAgent(json)],
                Err(e) => {
                    error!(error = %e, "Failed to serialize keepalive reply");
                    Vec::new()
                }
            }
        }
        AgentMessage::UserTranscript {
            user_transcription_event,
        } => {
            let text = user_transcription_event.user_transcript;
            if text.is_empty() {
                Vec::new()
            } else {
                debug!(%text, "Caller utterance transcribed");
                vec![AgentAction::Caller(text)]
            }
        }
        AgentMessage::AgentResponse {
            agent_response_event,
        } => {
            let text = agent_response_event.agent_response;
            if text.is_empty() {
                Vec::new()
            } else {
                debug!(%text, "Agent utterance");
                vec![AgentAction::Agent(text)]
            }
        }
        AgentMessage::InternalTentativeAgentResponse => Vec::new(),
        AgentMessage::Error { error } => {
            // Provider errors are often transient; the session continues.
            error!(%error, "Voice-AI provider reported an error");
            Vec::new()
        }
        AgentMessage::Unknown => {
            debug!("Ignoring unknown voice-AI message type");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::{AgentResponseEvent, AudioEvent, PingEvent, UserTranscriptionEvent};

    fn audio(payload: &str) -> AgentMessage {
        AgentMessage::Audio {
            audio_event: AudioEvent {
                audio_base_64: payload.into(),
            },
        }
    }

    #[test]
    fn audio_becomes_media_frame_for_session_stream() {
        let actions = dispatch(audio("cGNt"), "MZ0123");
        assert_eq!(
            actions,
            vec![AgentAction::ToTelephony(TelephonyOut::Media {
                stream_sid: "MZ0123".into(),
                media: MediaPayload {
                    payload: "cGNt".into()
                },
            })]
        );
    }

    #[test]
    fn interruption_yields_exactly_one_clear_before_next_turn_audio() {
        let interruption = dispatch(AgentMessage::Interruption, "MZ0123");
        assert_eq!(
            interruption,
            vec![AgentAction::ToTelephony(TelephonyOut::Clear {
                stream_sid: "MZ0123".into()
            })]
        );

        // Messages are dispatched in arrival order, so the clear frame is
        // fully emitted before the following turn's audio is even examined.
        let next_turn = dispatch(audio("bmV4dA=="), "MZ0123");
        assert!(matches!(
            next_turn.as_slice(),
            [AgentAction::ToTelephony(TelephonyOut::Media { .. })]
        ));
    }

    #[test]
    fn ping_is_answered_with_matching_event_id() {
        let actions = dispatch(
            AgentMessage::Ping {
                ping_event: PingEvent { event_id: 42 },
            },
            "MZ0123",
        );
        match actions.as_slice() {
            [AgentAction::ToAgent(json)] => {
                let value: serde_json::Value = serde_json::from_str(json).unwrap();
                assert_eq!(value["type"], "pong");
                assert_eq!(value["event_id"], 42);
            }
            other => panic!("expected a single pong, got {other:?}"),
        }
    }

    #[test]
    fn transcripts_become_session_events_in_arrival_order() {
        let caller = dispatch(
            AgentMessage::UserTranscript {
                user_transcription_event: UserTranscriptionEvent {
                    user_transcript: "I feel great today".into(),
                },
            },
            "MZ0123",
        );
        assert_eq!(
            caller,
            vec![AgentAction::Caller("I feel great today".into())]
        );

        let agent = dispatch(
            AgentMessage::AgentResponse {
                agent_response_event: AgentResponseEvent {
                    agent_response: "Glad to hear it.".into(),
                },
            },
            "MZ0123",
        );
        assert_eq!(agent, vec![AgentAction::Agent("Glad to hear it.".into())]);
    }

    #[test]
    fn empty_transcripts_are_dropped() {
        let actions = dispatch(
            AgentMessage::UserTranscript {
                user_transcription_event: UserTranscriptionEvent {
                    user_transcript: String::new(),
                },
            },
            "MZ0123",
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn errors_and_noise_require_no_action() {
        assert!(dispatch(
            AgentMessage::Error {
                error: serde_json::json!({"message": "turbulence"})
            },
            "MZ0123"
        )
        .is_empty());
        assert!(dispatch(AgentMessage::InternalTentativeAgentResponse, "MZ0123").is_empty());
        assert!(dispatch(AgentMessage::Unknown, "MZ0123").is_empty());
    }

    #[tokio::test]
    async fn connect_timeout_is_an_error_not_a_panic() {
        // A listener that accepts the TCP connection but never answers the
        // WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = connect_agent(&format!("ws://{addr}"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(CallError::Session(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_a_gateway_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_agent(&format!("ws://{addr}"), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(CallError::Gateway(_))));
    }
}
