//! Per-session state machine wiring the registry, upstream bridge, turn
//! reassembler and codec together: start, forward-audio, end, and the
//! forced-close paths (transport loss, upstream failure, idle timeout).

use crate::config::Config;
use crate::session::registry::{SessionRegistry, SessionStatus, VoiceSession};
use crate::session::turn::{self, Drained, Terminal};
use crate::sink::ClientSink;
use crate::ws::protocol::ServerMessage;
use base64::Engine;
use gemini_live::{LiveConfig, LiveError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const WATCHDOG_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("speech model API key is not configured")]
    MissingApiKey,
    #[error("failed to open upstream connection: {0}")]
    Upstream(#[from] LiveError),
}

impl StartError {
    /// Client-facing error string and detail, shared by both transports.
    pub fn describe(&self) -> (&'static str, Option<String>) {
        match self {
            StartError::MissingApiKey => (
                "API key not configured",
                Some("Set GEMINI_API_KEY in the relay environment.".to_string()),
            ),
            StartError::Upstream(e) => ("failed to start session", Some(e.to_string())),
        }
    }

    /// The structured error payload reported to the client.
    pub fn client_message(&self) -> ServerMessage {
        let (error, details) = self.describe();
        ServerMessage::Error {
            error: error.to_string(),
            details,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: SessionRegistry,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(registry: SessionRegistry, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Creates a session and opens its upstream connection. Returns only
    /// once the upstream setup handshake has completed, so audio forwarded
    /// afterwards never meets a half-open handle.
    ///
    /// A second `start` for an id that is still live supersedes it: the old
    /// upstream handle is closed before the new session is created.
    pub async fn start(
        &self,
        session_id: &str,
        sample_rate: Option<u32>,
        conn: Option<u64>,
    ) -> Result<Arc<VoiceSession>, StartError> {
        if let Some(previous) = self.registry.remove(session_id) {
            warn!(%session_id, "superseding existing session with the same id");
            previous.abort_tasks();
            if let Some(handle) = previous.take_upstream().await {
                handle.close();
            }
            previous.set_status(SessionStatus::Closed);
        }

        let api_key = self
            .config
            .gemini_api_key
            .as_deref()
            .ok_or(StartError::MissingApiKey)?;

        let session = self.registry.create(session_id);
        session.set_client_conn(conn);
        if let Some(rate) = sample_rate {
            session.set_input_mime(format!("audio/pcm;rate={rate}"));
        }

        let live_config = LiveConfig {
            model: self.config.live_model.clone(),
            voice: self.config.voice_name.clone(),
            ..LiveConfig::default()
        };
        match gemini_live::connect(api_key, &live_config).await {
            Ok((handle, events)) => {
                if let Some(displaced) = session.install_upstream(handle, events).await {
                    displaced.close();
                }
                session.transition(&[SessionStatus::Creating], SessionStatus::Ready);
                session.touch();
                info!(%session_id, "voice session ready");
                Ok(session)
            }
            Err(e) => {
                self.registry.remove(session_id);
                session.set_status(SessionStatus::Errored);
                error!(%session_id, error = %e, "failed to open upstream connection");
                Err(e.into())
            }
        }
    }

    /// Spawns the socket-mode delivery loop: waits on the pending queue,
    /// pushes completed turns and side events to the client, and tears the
    /// session down when the upstream ends.
    pub fn attach_delivery(&self, session: &Arc<VoiceSession>, sink: Arc<dyn ClientSink>) {
        let orchestrator = self.clone();
        let session = session.clone();
        let task = tokio::spawn({
            let session = session.clone();
            async move {
                loop {
                    let drained = turn::drain_next(&session).await;
                    match deliver(sink.as_ref(), drained).await {
                        None => {}
                        Some(Terminal::Closed(reason)) => {
                            let _ = sink
                                .send_event(ServerMessage::SessionEnded {
                                    session_id: session.id.clone(),
                                    reason,
                                })
                                .await;
                            orchestrator.cleanup(&session, SessionStatus::Closed).await;
                            return;
                        }
                        Some(Terminal::Error(message)) => {
                            let _ = sink
                                .send_event(ServerMessage::Error {
                                    error: "upstream connection error".to_string(),
                                    details: Some(message),
                                })
                                .await;
                            orchestrator.cleanup(&session, SessionStatus::Errored).await;
                            return;
                        }
                    }
                }
            }
        });
        session.adopt_task(task);
    }

    /// Spawns the idle watchdog, if an idle timeout is configured. A session
    /// with no forwarded audio and no upstream activity for the whole window
    /// is force-closed; this covers clients that vanish without a transport
    /// close signal, which the chunked-HTTP mode cannot observe.
    pub fn attach_watchdog(&self, session: &Arc<VoiceSession>, sink: Option<Arc<dyn ClientSink>>) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let orchestrator = self.clone();
        let session_ref = session.clone();
        let task = tokio::spawn(async move {
            let tick = WATCHDOG_TICK.min(idle_timeout);
            loop {
                tokio::time::sleep(tick).await;
                if session_ref.status().is_terminal() {
                    return;
                }
                if session_ref.idle_for() >= idle_timeout {
                    warn!(session_id = %session_ref.id, "session idle past configured timeout, forcing close");
                    orchestrator
                        .force_close(&session_ref.id, sink.as_deref(), "idle timeout")
                        .await;
                    return;
                }
            }
        });
        session.adopt_task(task);
    }

    /// Forwards one frame of raw PCM upstream. Invalid conditions (unknown
    /// session, wrong socket, not ready) are logged and dropped; a bad frame
    /// must never tear down the transport.
    pub async fn forward_audio(
        &self,
        session_id: &str,
        bytes: &[u8],
        mime: Option<&str>,
        conn: Option<u64>,
    ) {
        let Some(session) = self.registry.get(session_id) else {
            warn!(%session_id, "dropping audio for unknown session");
            return;
        };
        if let Some(conn) = conn
            && !session.owned_by(conn)
        {
            warn!(%session_id, conn, "dropping audio from a socket that does not own this session");
            return;
        }
        let status = session.status();
        if !status.accepts_audio() {
            warn!(%session_id, ?status, "session not ready for audio, discarding frame");
            return;
        }

        let mime = mime
            .map(str::to_string)
            .unwrap_or_else(|| session.input_mime());
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        if let Err(e) = session.upstream_send_audio(payload, &mime).await {
            warn!(%session_id, error = %e, "failed to forward audio upstream");
            return;
        }
        session.transition(&[SessionStatus::Ready], SessionStatus::Streaming);
        session.touch();
    }

    /// Non-blocking poll used by the chunked-HTTP transport after each
    /// forwarded chunk. A terminal upstream condition observed here also
    /// cleans the session up.
    pub async fn poll(&self, session_id: &str) -> Option<Drained> {
        let session = self.registry.get(session_id)?;
        let drained = turn::drain_available(&session).await;
        if let Some(terminal) = &drained.terminal {
            let status = match terminal {
                Terminal::Error(_) => SessionStatus::Errored,
                Terminal::Closed(_) => SessionStatus::Closed,
            };
            self.cleanup(&session, status).await;
        }
        Some(drained)
    }

    /// Graceful end: waits (bounded) for the final turn, then tears the
    /// session down. Returns what should be delivered to the client, or
    /// `None` when the session is unknown or already closing; a forced close
    /// followed by an explicit `end` is a no-op, not an error.
    pub async fn end(&self, session_id: &str) -> Option<Drained> {
        let Some(session) = self.registry.get(session_id) else {
            info!(%session_id, "end for unknown session, ignoring");
            return None;
        };
        if !session.transition(
            &[
                SessionStatus::Creating,
                SessionStatus::Ready,
                SessionStatus::Streaming,
            ],
            SessionStatus::Closing,
        ) {
            info!(%session_id, "session already closing, ignoring duplicate end");
            return None;
        }

        // Stop the delivery loop and watchdog so the final drain owns the
        // pending queue.
        session.abort_tasks();
        let drained = turn::await_final_turn(&session, self.config.final_turn_timeout).await;
        self.cleanup(&session, SessionStatus::Closed).await;
        Some(drained)
    }

    /// Immediate close used when the transport drops, the upstream fails, or
    /// the watchdog fires. Accumulated audio is still flushed best-effort.
    pub async fn force_close(&self, session_id: &str, sink: Option<&dyn ClientSink>, reason: &str) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if !session.transition(
            &[
                SessionStatus::Creating,
                SessionStatus::Ready,
                SessionStatus::Streaming,
            ],
            SessionStatus::Closing,
        ) {
            return;
        }
        info!(%session_id, reason, "force-closing session");
        session.abort_tasks();

        let mut drained = turn::drain_available(&session).await;
        if drained.wav.is_none() {
            drained.wav = turn::flush_partial(&session);
        }
        if let Some(sink) = sink {
            let terminal = deliver(sink, drained).await;
            let reason = match terminal {
                Some(Terminal::Closed(Some(upstream_reason))) => upstream_reason,
                Some(Terminal::Error(message)) => message,
                _ => reason.to_string(),
            };
            let _ = sink
                .send_event(ServerMessage::SessionEnded {
                    session_id: session.id.clone(),
                    reason: Some(reason),
                })
                .await;
        }
        self.cleanup(&session, SessionStatus::Closed).await;
    }

    async fn cleanup(&self, session: &Arc<VoiceSession>, status: SessionStatus) {
        self.registry.remove(&session.id);
        if let Some(handle) = session.take_upstream().await {
            handle.close();
        }
        session.set_status(status);
        session.abort_tasks();
    }
}

/// Pushes a drain result through a sink, returning the terminal condition
/// for the caller to act on. Send failures are ignored; the transport may
/// already be gone, and cleanup must proceed regardless.
async fn deliver(sink: &dyn ClientSink, drained: Drained) -> Option<Terminal> {
    for event in drained.events {
        let _ = sink.send_event(event.into()).await;
    }
    if let Some(wav) = drained.wav {
        let _ = sink.send_audio(wav).await;
    }
    drained.terminal
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gemini_live::types::{Blob, ModelTurn, ServerContent, ServerPart};
    use gemini_live::{ClientMessage as LiveClientMessage, LiveEvent, LiveHandle};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn test_config(api_key: Option<&str>) -> Arc<Config> {
        Arc::new(Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            gemini_api_key: api_key.map(str::to_string),
            live_model: "models/gemini-2.0-flash-live-001".to_string(),
            voice_name: "Zephyr".to_string(),
            idle_timeout: None,
            final_turn_timeout: Duration::from_millis(50),
            log_level: tracing::Level::INFO,
        })
    }

    fn orchestrator(api_key: Option<&str>) -> (Orchestrator, SessionRegistry) {
        let registry = SessionRegistry::new();
        (
            Orchestrator::new(registry.clone(), test_config(api_key)),
            registry,
        )
    }

    /// Installs a detached upstream so session logic can run without a
    /// network connection.
    async fn ready_session(
        registry: &SessionRegistry,
        id: &str,
    ) -> (
        Arc<VoiceSession>,
        mpsc::UnboundedSender<LiveEvent>,
        mpsc::Receiver<LiveClientMessage>,
    ) {
        let session = registry.create(id);
        let (handle, upstream_rx) = LiveHandle::detached();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        session.install_upstream(handle, events_rx).await;
        session.set_status(SessionStatus::Ready);
        (session, events_tx, upstream_rx)
    }

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

    #[derive(Default)]
    struct FakeSink {
        events: Mutex<Vec<ServerMessage>>,
        audio: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ClientSink for FakeSink {
        async fn send_event(&self, msg: ServerMessage) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(msg);
            Ok(())
        }

        async fn send_audio(&self, wav: Vec<u8>) -> anyhow::Result<()> {
            self.audio.lock().unwrap().push(wav);
            Ok(())
        }
    }

    #[tokio::test]
    async fn audio_for_unknown_session_is_a_harmless_no_op() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        orchestrator
            .forward_audio("ghost", &[1, 2, 3], None, None)
            .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn audio_before_ready_is_discarded() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (session, _events_tx, mut upstream) = ready_session(&registry, "s1").await;
        session.set_status(SessionStatus::Creating);

        orchestrator.forward_audio("s1", &[1, 2], None, None).await;
        assert!(upstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarded_audio_reaches_upstream_base64_encoded() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (session, _events_tx, mut upstream) = ready_session(&registry, "s1").await;

        orchestrator.forward_audio("s1", &[1, 2], None, None).await;

        match upstream.recv().await {
            Some(LiveClientMessage::RealtimeInput(input)) => {
                assert_eq!(input.audio.data, "AQI=");
                assert_eq!(input.audio.mime_type, "audio/pcm;rate=44100");
            }
            other => panic!("expected RealtimeInput, got {:?}", other),
        }
        assert_eq!(session.status(), SessionStatus::Streaming);
    }

    #[tokio::test]
    async fn audio_from_the_wrong_socket_is_dropped() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (session, _events_tx, mut upstream) = ready_session(&registry, "s1").await;
        session.set_client_conn(Some(7));

        orchestrator.forward_audio("s1", &[1, 2], None, Some(8)).await;
        assert!(upstream.try_recv().is_err());

        orchestrator.forward_audio("s1", &[1, 2], None, Some(7)).await;
        assert!(upstream.recv().await.is_some());
    }

    #[tokio::test]
    async fn start_without_api_key_is_a_typed_error() {
        let (orchestrator, registry) = orchestrator(None);
        let err = orchestrator.start("s1", None, None).await.unwrap_err();
        assert!(matches!(err, StartError::MissingApiKey));
        assert!(registry.is_empty());

        match err.client_message() {
            ServerMessage::Error { error, .. } => assert_eq!(error, "API key not configured"),
            other => panic!("expected error message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_start_supersedes_and_closes_the_previous_upstream() {
        let (orchestrator, registry) = orchestrator(None);
        let (_session, _events_tx, mut upstream) = ready_session(&registry, "s1").await;

        // The restart fails on the missing key, but the superseded session
        // must already have been removed and its upstream closed.
        let err = orchestrator.start("s1", None, None).await.unwrap_err();
        assert!(matches!(err, StartError::MissingApiKey));
        assert!(registry.get("s1").is_none());
        assert!(upstream.recv().await.is_none());
    }

    #[tokio::test]
    async fn end_for_unknown_session_is_a_no_op() {
        let (orchestrator, _registry) = orchestrator(Some("key"));
        assert!(orchestrator.end("ghost").await.is_none());
    }

    #[tokio::test]
    async fn end_flushes_a_partial_turn_and_removes_the_session() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (session, events_tx, _upstream) = ready_session(&registry, "s1").await;
        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx.send(audio_part("Ag==")).unwrap();

        let drained = orchestrator.end("s1").await.expect("first end runs");
        let wav = drained.wav.expect("partial audio must be flushed");
        assert_eq!(&wav[44..], &[1u8, 2]);

        assert!(registry.is_empty());
        assert_eq!(session.status(), SessionStatus::Closed);

        // The session is gone; a duplicate end finds nothing to do.
        assert!(orchestrator.end("s1").await.is_none());
    }

    #[tokio::test]
    async fn force_close_flushes_fragments_to_the_sink() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (_session, events_tx, _upstream) = ready_session(&registry, "s1").await;
        events_tx.send(audio_part("AQ==")).unwrap(); // X
        events_tx.send(audio_part("Ag==")).unwrap(); // Y

        let sink = Arc::new(FakeSink::default());
        orchestrator
            .force_close("s1", Some(sink.as_ref()), "transport closed")
            .await;

        let audio = sink.audio.lock().unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(&audio[0][44..], &[1u8, 2]);

        let events = sink.events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(ServerMessage::SessionEnded { reason: Some(r), .. }) if r == "transport closed"
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn force_close_then_end_is_idempotent() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (_session, _events_tx, _upstream) = ready_session(&registry, "s1").await;

        orchestrator.force_close("s1", None, "transport closed").await;
        assert!(registry.is_empty());
        assert!(orchestrator.end("s1").await.is_none());
    }

    #[tokio::test]
    async fn delivery_loop_pushes_turns_and_cleans_up_on_close() {
        let (orchestrator, registry) = orchestrator(Some("key"));
        let (session, events_tx, _upstream) = ready_session(&registry, "s1").await;
        let sink = Arc::new(FakeSink::default());
        orchestrator.attach_delivery(&session, sink.clone());

        events_tx.send(audio_part("AQ==")).unwrap();
        events_tx
            .send(LiveEvent::Content(ServerContent {
                turn_complete: Some(true),
                ..Default::default()
            }))
            .unwrap();
        events_tx.send(LiveEvent::Closed(Some("server done".to_string()))).unwrap();

        // The loop observes the close after delivering the turn and removes
        // the session.
        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());

        let audio = sink.audio.lock().unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(&audio[0][44..], &[1u8]);
        let events = sink.events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(ServerMessage::SessionEnded { reason: Some(r), .. }) if r == "server done"
        ));
    }
}
