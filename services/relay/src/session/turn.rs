//! Reassembles streamed model output into playable turns.
//!
//! Upstream messages queue in the session's pending channel in delivery
//! order. Draining pops them FIFO, accumulates inline audio fragments, and
//! cuts a WAV buffer when a turn-complete marker arrives. A single drain
//! returns at most one completed turn; coalescing two turns would misorder
//! playback.

use crate::session::registry::{SessionStatus, VoiceSession};
use crate::wav;
use crate::ws::protocol::ServerMessage;
use gemini_live::{FunctionResponse, LiveEvent};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

/// Non-audio output surfaced to the client alongside the audio path.
#[derive(Debug)]
pub enum SideEvent {
    Text(String),
    ToolCall {
        id: Option<String>,
        name: String,
        args: serde_json::Value,
    },
}

impl From<SideEvent> for ServerMessage {
    fn from(event: SideEvent) -> Self {
        match event {
            SideEvent::Text(text) => ServerMessage::Text { text },
            SideEvent::ToolCall { id, name, args } => ServerMessage::ToolCall { id, name, args },
        }
    }
}

/// Why the upstream stream ended, when it did.
#[derive(Debug)]
pub enum Terminal {
    Closed(Option<String>),
    Error(String),
}

/// The result of one drain pass over a session's pending queue.
#[derive(Debug, Default)]
pub struct Drained {
    /// At most one completed (or best-effort partial) turn of audio.
    pub wav: Option<Vec<u8>>,
    pub events: Vec<SideEvent>,
    pub terminal: Option<Terminal>,
}

/// Non-blocking poll: processes whatever is already queued and returns. The
/// caller re-polls on its next inbound event.
pub async fn drain_available(session: &VoiceSession) -> Drained {
    let mut out = Drained::default();
    let mut guard = session.lock_pending().await;
    if let Some(rx) = guard.as_mut() {
        drain_ready(session, rx, &mut out).await;
    }
    drop(guard);
    if out.terminal.is_some() && out.wav.is_none() {
        out.wav = flush_partial(session);
    }
    out
}

/// Blocking variant for the socket delivery loop: waits for the next
/// upstream event, then drains greedily up to one completed turn.
pub async fn drain_next(session: &VoiceSession) -> Drained {
    let mut out = Drained::default();
    let mut guard = session.lock_pending().await;
    match guard.as_mut() {
        Some(rx) => match rx.recv().await {
            Some(event) => {
                if !apply(session, event, &mut out).await {
                    drain_ready(session, rx, &mut out).await;
                }
            }
            None => out.terminal = Some(Terminal::Closed(None)),
        },
        None => out.terminal = Some(Terminal::Closed(None)),
    }
    drop(guard);
    if out.terminal.is_some() && out.wav.is_none() {
        out.wav = flush_partial(session);
    }
    out
}

/// Bounded wait used only at session end: drains until a turn completes, the
/// upstream ends, or `max_wait` elapses. Whatever fragments remain are
/// flushed as a best-effort final buffer so the user still hears what the
/// model produced.
pub async fn await_final_turn(session: &VoiceSession, max_wait: Duration) -> Drained {
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut out = Drained::default();
    {
        let mut guard = session.lock_pending().await;
        if let Some(rx) = guard.as_mut() {
            loop {
                if drain_ready(session, rx, &mut out).await {
                    break;
                }
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(event)) => {
                        if apply(session, event, &mut out).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        if out.terminal.is_none() {
                            out.terminal = Some(Terminal::Closed(None));
                        }
                        break;
                    }
                    Err(_) => {
                        debug!(session_id = %session.id, "timed out waiting for final turn");
                        break;
                    }
                }
            }
        }
    }
    if out.wav.is_none() {
        out.wav = flush_partial(session);
    }
    out
}

/// Encodes any accumulated fragments without waiting for a turn-complete
/// marker. Used on every forced-close path; fragments must never be silently
/// discarded at teardown.
pub fn flush_partial(session: &VoiceSession) -> Option<Vec<u8>> {
    let fragments = session.take_fragments();
    if fragments.is_empty() {
        return None;
    }
    match wav::encode_wav(&fragments, &session.output_mime) {
        Ok(buffer) => Some(buffer),
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "failed to encode partial audio at close");
            None
        }
    }
}

/// Processes everything currently in the queue. Returns true when the drain
/// should stop: a turn completed or the stream ended.
async fn drain_ready(
    session: &VoiceSession,
    rx: &mut mpsc::UnboundedReceiver<LiveEvent>,
    out: &mut Drained,
) -> bool {
    loop {
        match rx.try_recv() {
            Ok(event) => {
                if apply(session, event, out).await {
                    return true;
                }
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => {
                if out.terminal.is_none() {
                    out.terminal = Some(Terminal::Closed(None));
                }
                return true;
            }
        }
    }
}

/// Applies one upstream event to the session. Returns true when the drain
/// should stop.
async fn apply(session: &VoiceSession, event: LiveEvent, out: &mut Drained) -> bool {
    session.touch();
    match event {
        LiveEvent::Content(content) => {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        session.push_fragment(blob.data);
                    }
                    if let Some(text) = part.text {
                        out.events.push(SideEvent::Text(text));
                    }
                }
            }
            if content.turn_complete == Some(true) {
                session.transition(&[SessionStatus::Streaming], SessionStatus::Ready);
                if session.has_fragments() {
                    let fragments = session.take_fragments();
                    match wav::encode_wav(&fragments, &session.output_mime) {
                        Ok(buffer) => {
                            out.wav = Some(buffer);
                            return true;
                        }
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "failed to encode completed turn, discarding");
                        }
                    }
                }
            }
            false
        }
        LiveEvent::ToolCall(calls) => {
            // Always answer, even if only with a placeholder; an unanswered
            // call stalls the turn indefinitely.
            let responses: Vec<FunctionResponse> = calls
                .iter()
                .map(|call| FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: json!({"result": "acknowledged"}),
                })
                .collect();
            if let Err(e) = session.upstream_send_tool_responses(responses).await {
                warn!(session_id = %session.id, error = %e, "failed to acknowledge tool call upstream");
            }
            for call in calls {
                out.events.push(SideEvent::ToolCall {
                    id: call.id,
                    name: call.name,
                    args: call.args,
                });
            }
            false
        }
        LiveEvent::Error(message) => {
            out.terminal = Some(Terminal::Error(message));
            true
        }
        LiveEvent::Closed(reason) => {
            out.terminal = Some(Terminal::Closed(reason));
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::SessionRegistry;
    use gemini_live::types::{Blob, FunctionCall, ModelTurn, ServerContent, ServerPart};
    use gemini_live::{ClientMessage, LiveHandle};
    use std::sync::Arc;

    fn audio_part(data: &str) -> LiveEvent {
        LiveEvent::Content(ServerContent {
            model_turn: Some(ModelTurn {
                parts: vec![ServerPart {
                    inline_data: Some(Blob {
                        mime_type: "audio/pcm;rate=24000".to_string(),
                        data: data.to_string(),
                    }),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        })
    }

    fn turn_complete() -> LiveEvent {
        LiveEvent::Content(ServerContent {
            turn_complete: Some(true),
            ..Default::default()
        })
    }

    async fn session_with_queue() -> (
        Arc<VoiceSession>,
        mpsc::UnboundedSender<LiveEvent>,
        mpsc::Receiver<ClientMessage>,
    ) {
        let registry = SessionRegistry::new();
        let session = registry.create("test-session");
        let (handle, upstream_rx) = LiveHandle::detached();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        session.install_upstream(handle, events_rx).await;
        (session, events_tx, upstream_rx)
    }

    fn pcm_payload(wav: &[u8]) -> &[u8] {
        &wav[44..]
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_across_a_drain() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        // 0x01, 0x02, 0x03 as separate fragments.
        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx.send(audio_part("Ag==")).unwrap();
        events_tx.send(audio_part("Aw==")).unwrap();
        events_tx.send(turn_complete()).unwrap();

        let drained = drain_available(&session).await;
        let wav = drained.wav.expect("completed turn should produce audio");
        assert_eq!(pcm_payload(&wav), &[1u8, 2, 3]);
    }

    #[tokio::test]
    async fn separate_turns_yield_separate_buffers() {
        let (session, events_tx, _upstream) = session_with_queue().await;

        events_tx.send(audio_part("AQ==")).unwrap(); // A
        events_tx.send(audio_part("Ag==")).unwrap(); // B
        events_tx.send(turn_complete()).unwrap();
        let first = drain_available(&session).await;
        assert_eq!(pcm_payload(first.wav.as_ref().unwrap()), &[1u8, 2]);

        events_tx.send(audio_part("Aw==")).unwrap(); // C
        events_tx.send(turn_complete()).unwrap();
        let second = drain_available(&session).await;
        assert_eq!(pcm_payload(second.wav.as_ref().unwrap()), &[3u8]);
    }

    #[tokio::test]
    async fn one_drain_never_coalesces_two_queued_turns() {
        let (session, events_tx, _upstream) = session_with_queue().await;

        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx.send(turn_complete()).unwrap();
        events_tx.send(audio_part("Ag==")).unwrap();
        events_tx.send(turn_complete()).unwrap();

        let first = drain_available(&session).await;
        assert_eq!(pcm_payload(first.wav.as_ref().unwrap()), &[1u8]);

        let second = drain_available(&session).await;
        assert_eq!(pcm_payload(second.wav.as_ref().unwrap()), &[2u8]);
    }

    #[tokio::test]
    async fn drain_without_turn_complete_returns_nothing_and_keeps_fragments() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        events_tx.send(audio_part("AQ==")).unwrap();

        let drained = drain_available(&session).await;
        assert!(drained.wav.is_none());
        assert!(drained.terminal.is_none());
        assert!(session.has_fragments());
    }

    #[tokio::test]
    async fn text_parts_become_side_events() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        events_tx
            .send(LiveEvent::Content(ServerContent {
                model_turn: Some(ModelTurn {
                    parts: vec![ServerPart {
                        text: Some("thinking out loud".to_string()),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }))
            .unwrap();

        let drained = drain_available(&session).await;
        assert!(drained.wav.is_none());
        assert!(
            matches!(&drained.events[..], [SideEvent::Text(text)] if text == "thinking out loud")
        );
    }

    #[tokio::test]
    async fn every_tool_call_gets_a_placeholder_response() {
        let (session, events_tx, mut upstream) = session_with_queue().await;
        events_tx
            .send(LiveEvent::ToolCall(vec![FunctionCall {
                id: Some("call-1".to_string()),
                name: "generate_visual_explanation".to_string(),
                args: serde_json::json!({"question": "what is resonance"}),
            }]))
            .unwrap();

        let drained = drain_available(&session).await;
        assert!(matches!(
            &drained.events[..],
            [SideEvent::ToolCall { id: Some(id), .. }] if id == "call-1"
        ));

        match upstream.recv().await {
            Some(ClientMessage::ToolResponse(response)) => {
                assert_eq!(response.function_responses.len(), 1);
                assert_eq!(response.function_responses[0].id.as_deref(), Some("call-1"));
                assert_eq!(
                    response.function_responses[0].name,
                    "generate_visual_explanation"
                );
            }
            other => panic!("expected ToolResponse upstream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn await_final_turn_returns_the_completed_turn() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx.send(turn_complete()).unwrap();

        let drained = await_final_turn(&session, Duration::from_millis(500)).await;
        assert_eq!(pcm_payload(drained.wav.as_ref().unwrap()), &[1u8]);
    }

    #[tokio::test]
    async fn await_final_turn_flushes_partial_audio_on_timeout() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        events_tx.send(audio_part("AQ==")).unwrap(); // X
        events_tx.send(audio_part("Ag==")).unwrap(); // Y

        let drained = await_final_turn(&session, Duration::from_millis(50)).await;
        let wav = drained
            .wav
            .expect("partial fragments must still be flushed");
        assert_eq!(pcm_payload(&wav), &[1u8, 2]);
        assert!(!session.has_fragments());
    }

    #[tokio::test]
    async fn upstream_error_is_terminal_and_flushes_partial_audio() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx
            .send(LiveEvent::Error("socket reset".to_string()))
            .unwrap();

        let drained = drain_available(&session).await;
        assert!(matches!(drained.terminal, Some(Terminal::Error(_))));
        assert_eq!(pcm_payload(drained.wav.as_ref().unwrap()), &[1u8]);
    }

    #[tokio::test]
    async fn closed_channel_is_terminal() {
        let (session, events_tx, _upstream) = session_with_queue().await;
        drop(events_tx);

        let drained = drain_next(&session).await;
        assert!(matches!(drained.terminal, Some(Terminal::Closed(None))));
    }
}
