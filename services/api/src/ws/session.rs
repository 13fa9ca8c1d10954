//! The stream bridge: lifecycle of one live call session.
//!
//! Accepts the telephony provider's media-stream WebSocket, opens the
//! outbound voice-AI leg on the stream's `start` event, relays audio both
//! directions, and flushes the captured transcript into the call record when
//! either side ends the call.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::CallStore;
use crate::error::CallError;
use crate::state::AppState;
use crate::ws::outbound::{self, OutboundCommand, OutboundLeg, SessionEvent};
use crate::ws::protocol::{StreamStart, TelephonyFrame};
use crate::models::Transcript;

/// Axum handler to upgrade the telephony provider's stream connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(schedule_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state, schedule_id))
}

/// In-memory state of one live session. Never shared across sessions.
#[derive(Debug)]
struct StreamSession {
    schedule_id: Uuid,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    /// Whether the outbound voice-AI leg is currently up.
    outbound_up: bool,
    transcript: Transcript,
}

/// What the session must do in response to one inbound frame.
#[derive(Debug, PartialEq)]
enum FrameAction {
    /// First (and only) `start` event: open the outbound leg.
    Establish(StreamStart),
    /// Forward one caller-audio payload to the outbound leg.
    Forward(String),
    Terminate,
    Ignore,
}

impl StreamSession {
    fn new(schedule_id: Uuid) -> Self {
        Self {
            schedule_id,
            stream_sid: None,
            call_sid: None,
            outbound_up: false,
            transcript: Transcript::default(),
        }
    }

    fn on_frame(&mut self, frame: TelephonyFrame) -> FrameAction {
        match frame {
            TelephonyFrame::Start { start } => {
                if self.stream_sid.is_some() {
                    warn!("Duplicate start event, ignoring");
                    return FrameAction::Ignore;
                }
                self.stream_sid = Some(start.stream_sid.clone());
                self.call_sid = Some(start.call_sid.clone());
                FrameAction::Establish(start)
            }
            // Media before `start` (no stream id yet) or while the outbound
            // leg is down has nowhere to go.
            TelephonyFrame::Media { media } if self.outbound_up => {
                FrameAction::Forward(media.payload)
            }
            TelephonyFrame::Media { .. } => FrameAction::Ignore,
            TelephonyFrame::Stop => FrameAction::Terminate,
            TelephonyFrame::Unknown => FrameAction::Ignore,
        }
    }

    fn outbound_established(&mut self) {
        self.outbound_up = true;
    }

    fn outbound_lost(&mut self) {
        self.outbound_up = false;
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CallerUtterance(text) => self.transcript.caller.push(text),
            SessionEvent::AgentUtterance(text) => self.transcript.agent.push(text),
            SessionEvent::Closed => self.outbound_lost(),
        }
    }
}

/// Main handler for one media-stream connection.
#[instrument(name = "media_stream", skip_all, fields(%schedule_id, call_sid))]
async fn handle_stream(socket: WebSocket, state: Arc<AppState>, schedule_id: Uuid) {
    info!("Telephony provider connected, awaiting stream start");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx = Arc::new(Mutex::new(socket_tx));
    // The event channel exists for the whole session even though the
    // outbound leg comes up later, so the select loop below stays uniform.
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);

    let mut session = StreamSession::new(schedule_id);
    let mut leg: Option<OutboundLeg> = None;

    loop {
        tokio::select! {
            maybe_msg = socket_rx.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<TelephonyFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                // Per-message errors never tear down the session.
                                warn!(error = %e, "Malformed telephony frame, skipping");
                                continue;
                            }
                        };
                        match session.on_frame(frame) {
                            FrameAction::Establish(start) => {
                                tracing::Span::current().record("call_sid", start.call_sid.as_str());
                                info!(stream_sid = %start.stream_sid, "Stream started");
                                match establish_outbound(&state, &start, socket_tx.clone(), event_tx.clone()).await {
                                    Ok(new_leg) => {
                                        session.outbound_established();
                                        leg = Some(new_leg);
                                    }
                                    Err(e) => {
                                        // No retry: reconnecting mid-call would
                                        // desynchronize the conversation. The
                                        // call continues telephony-only.
                                        error!(error = %e, "Voice-AI leg setup failed; call continues without audio");
                                    }
                                }
                            }
                            FrameAction::Forward(payload) => {
                                if let Some(active) = &leg {
                                    if active.commands.send(OutboundCommand::Audio(payload)).await.is_err() {
                                        warn!("Voice-AI leg gone, dropping caller audio");
                                        session.outbound_lost();
                                    }
                                }
                            }
                            FrameAction::Terminate => {
                                info!("Stream stopped by telephony provider");
                                break;
                            }
                            FrameAction::Ignore => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Telephony provider disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Telephony leg receive error");
                        break;
                    }
                }
            }
            Some(event) = event_rx.recv() => {
                let closed = matches!(event, SessionEvent::Closed);
                session.on_event(event);
                if closed {
                    info!("Voice-AI leg closed, terminating session");
                    break;
                }
            }
        }
    }

    finish_session(&state, session, leg, &mut event_rx).await;
}

/// Establishing-Outbound: signed URL, bounded connect, session initiation.
async fn establish_outbound(
    state: &Arc<AppState>,
    start: &StreamStart,
    telephony_tx: Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Result<OutboundLeg, CallError> {
    let signed_url = state.voice.signed_endpoint().await?;
    let agent_socket =
        outbound::connect_agent(&signed_url, state.config.outbound_connect_timeout).await?;
    let init = state.voice.session_init(
        start.custom_parameters.get("prompt").map(String::as_str),
        start
            .custom_parameters
            .get("first_message")
            .map(String::as_str),
    );
    outbound::start_leg(
        agent_socket,
        init,
        telephony_tx,
        event_tx,
        start.stream_sid.clone(),
    )
    .await
}

/// Terminating: release the outbound leg and flush the transcript.
///
/// Resource release is unconditional; a persistence failure is logged but
/// must not prevent cleanup from completing.
async fn finish_session(
    state: &Arc<AppState>,
    mut session: StreamSession,
    leg: Option<OutboundLeg>,
    event_rx: &mut mpsc::Receiver<SessionEvent>,
) {
    if let Some(active) = leg {
        active.handle.abort();
    }

    // Utterances already delivered but not yet drained still belong to the
    // transcript.
    while let Ok(event) = event_rx.try_recv() {
        session.on_event(event);
    }

    match &session.call_sid {
        // An all-silent session has nothing to flush; the record keeps its
        // empty-transcript defaults.
        Some(call_sid) if session.transcript.is_empty() => {
            info!(%call_sid, "No utterances captured");
        }
        Some(call_sid) => {
            if let Err(e) = state.db.save_transcript(call_sid, &session.transcript).await {
                error!(%call_sid, error = %e, "Failed to persist transcript");
            } else {
                info!(
                    %call_sid,
                    caller_utterances = session.transcript.caller.len(),
                    agent_utterances = session.transcript.agent.len(),
                    "Transcript persisted"
                );
            }
        }
        None => {
            warn!(
                schedule_id = %session.schedule_id,
                "Session ended before stream start; nothing to persist"
            );
        }
    }
    info!("Session released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::MediaPayload;
    use std::collections::HashMap;

    fn start_frame(stream_sid: &str, call_sid: &str) -> TelephonyFrame {
        TelephonyFrame::Start {
            start: StreamStart {
                stream_sid: stream_sid.into(),
                call_sid: call_sid.into(),
                custom_parameters: HashMap::new(),
            },
        }
    }

    fn media_frame(payload: &str) -> TelephonyFrame {
        TelephonyFrame::Media {
            media: MediaPayload {
                payload: payload.into(),
            },
        }
    }

    #[test]
    fn media_before_start_is_dropped() {
        let mut session = StreamSession::new(Uuid::new_v4());
        assert_eq!(session.on_frame(media_frame("bXVsYXc=")), FrameAction::Ignore);
    }

    #[test]
    fn start_event_records_ids_and_establishes() {
        let mut session = StreamSession::new(Uuid::new_v4());
        match session.on_frame(start_frame("MZ0123", "CA0456")) {
            FrameAction::Establish(start) => assert_eq!(start.stream_sid, "MZ0123"),
            other => panic!("expected establish, got {other:?}"),
        }
        assert_eq!(session.stream_sid.as_deref(), Some("MZ0123"));
        assert_eq!(session.call_sid.as_deref(), Some("CA0456"));
    }

    #[test]
    fn duplicate_start_is_ignored() {
        let mut session = StreamSession::new(Uuid::new_v4());
        session.on_frame(start_frame("MZ0123", "CA0456"));
        session.outbound_established();
        assert_eq!(
            session.on_frame(start_frame("MZ9999", "CA9999")),
            FrameAction::Ignore
        );
        assert_eq!(session.stream_sid.as_deref(), Some("MZ0123"));
    }

    #[test]
    fn media_forwards_only_while_outbound_leg_is_up() {
        let mut session = StreamSession::new(Uuid::new_v4());
        session.on_frame(start_frame("MZ0123", "CA0456"));

        // Outbound leg not yet (or no longer) up: dead air, frames dropped.
        assert_eq!(session.on_frame(media_frame("YQ==")), FrameAction::Ignore);

        session.outbound_established();
        assert_eq!(
            session.on_frame(media_frame("YQ==")),
            FrameAction::Forward("YQ==".into())
        );

        session.outbound_lost();
        assert_eq!(session.on_frame(media_frame("YQ==")), FrameAction::Ignore);
    }

    #[test]
    fn stop_terminates() {
        let mut session = StreamSession::new(Uuid::new_v4());
        session.on_frame(start_frame("MZ0123", "CA0456"));
        assert_eq!(session.on_frame(TelephonyFrame::Stop), FrameAction::Terminate);
    }

    #[test]
    fn utterances_accumulate_in_arrival_order() {
        let mut session = StreamSession::new(Uuid::new_v4());
        session.on_event(SessionEvent::AgentUtterance("How are you feeling?".into()));
        session.on_event(SessionEvent::CallerUtterance("I feel great today".into()));
        session.on_event(SessionEvent::AgentUtterance("Glad to hear it.".into()));
        session.on_event(SessionEvent::CallerUtterance("Thanks for asking".into()));

        assert_eq!(
            session.transcript.caller,
            vec!["I feel great today", "Thanks for asking"]
        );
        assert_eq!(
            session.transcript.agent,
            vec!["How are you feeling?", "Glad to hear it."]
        );
    }

    #[test]
    fn closed_event_marks_outbound_leg_down() {
        let mut session = StreamSession::new(Uuid::new_v4());
        session.outbound_established();
        session.on_event(SessionEvent::Closed);
        assert!(!session.outbound_up);
    }
}
