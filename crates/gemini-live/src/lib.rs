//! Streaming client for the Gemini Live (`BidiGenerateContent`) API.
//!
//! [`connect`] performs the WebSocket handshake and setup exchange, then hands
//! back a [`LiveHandle`] for outbound frames and an unbounded receiver of
//! [`LiveEvent`]s for everything the model sends. The receiver side is fed by
//! a dedicated reader task so a slow consumer never backpressures the socket
//! receive loop.

pub mod types;

use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

pub use types::{
    Blob, ClientContent, ClientMessage, Content, ContentPart, ContextWindowCompression,
    FunctionCall, FunctionResponse, GenerationConfig, LiveEvent, MediaResolution, RawServerMessage,
    RealtimeInput, RealtimeInputConfig, ResponseModality, ServerContent, Setup, SlidingWindow,
    SpeechConfig, ToolResponse, TurnCoverage,
};

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("failed to reach the Gemini Live endpoint: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("setup handshake failed: {0}")]
    Handshake(String),
    #[error("timed out waiting for setup to complete")]
    SetupTimeout,
    #[error("connection closed before setup completed")]
    ClosedDuringSetup,
    #[error("upstream connection is no longer open")]
    Disconnected,
    #[error("failed to serialize client frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Connection parameters sent in the initial `setup` frame.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub media_resolution: MediaResolution,
    pub turn_coverage: TurnCoverage,
    /// Token count at which the server starts compressing history.
    pub compression_trigger_tokens: u64,
    /// Token budget the compressed history is reduced to.
    pub compression_target_tokens: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Zephyr".to_string(),
            media_resolution: MediaResolution::Medium,
            turn_coverage: TurnCoverage::IncludesAllInput,
            compression_trigger_tokens: 25600,
            compression_target_tokens: 12800,
        }
    }
}

impl LiveConfig {
    fn setup_message(&self) -> Setup {
        Setup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                media_resolution: Some(self.media_resolution),
                speech_config: Some(SpeechConfig::prebuilt(&self.voice)),
            },
            realtime_input_config: Some(RealtimeInputConfig {
                turn_coverage: self.turn_coverage,
            }),
            context_window_compression: Some(ContextWindowCompression {
                trigger_tokens: self.compression_trigger_tokens,
                sliding_window: SlidingWindow {
                    target_tokens: self.compression_target_tokens,
                },
            }),
        }
    }
}

/// Owner's handle to one live upstream connection.
///
/// Dropping or [`close`](LiveHandle::close)-ing the handle shuts the outbound
/// channel; the writer task then sends a close frame and exits.
#[derive(Debug)]
pub struct LiveHandle {
    outbound: mpsc::Sender<ClientMessage>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveHandle {
    /// Forwards one chunk of base64-encoded PCM as realtime input.
    pub async fn send_audio(&self, data: String, mime_type: &str) -> Result<(), LiveError> {
        self.send(ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: mime_type.to_string(),
                data,
            },
        }))
        .await
    }

    /// Sends explicit conversation turns, e.g. a text prompt.
    pub async fn send_client_content(&self, content: ClientContent) -> Result<(), LiveError> {
        self.send(ClientMessage::ClientContent(content)).await
    }

    /// Answers one or more pending tool calls.
    pub async fn send_tool_responses(
        &self,
        responses: Vec<FunctionResponse>,
    ) -> Result<(), LiveError> {
        self.send(ClientMessage::ToolResponse(ToolResponse {
            function_responses: responses,
        }))
        .await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), LiveError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| LiveError::Disconnected)
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Tears the connection down. The writer drains and sends a close frame;
    /// the reader is stopped, which also ends the event stream.
    pub fn close(mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // Dropping `outbound` lets the writer finish naturally.
    }

    /// A handle backed only by an in-memory channel, with no socket behind
    /// it. The receiver yields the frames that would have gone upstream.
    pub fn detached() -> (Self, mpsc::Receiver<ClientMessage>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            Self {
                outbound,
                reader: None,
                writer: None,
            },
            rx,
        )
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            // The writer exits on its own once the outbound sender is gone;
            // detach rather than abort so the close frame still goes out.
            drop(writer);
        }
    }
}

/// Opens a connection, sends the `setup` frame, and waits for the server's
/// `setupComplete` acknowledgment before returning. Audio must not be sent
/// through any path that bypasses this; a half-open connection drops frames.
pub async fn connect(
    api_key: &str,
    config: &LiveConfig,
) -> Result<(LiveHandle, mpsc::UnboundedReceiver<LiveEvent>), LiveError> {
    let url = format!("{LIVE_ENDPOINT}?key={api_key}");
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    debug!(model = %config.model, "connected to Gemini Live endpoint, sending setup");

    let setup = ClientMessage::Setup(config.setup_message());
    ws_tx
        .send(WsMessage::Text(serde_json::to_string(&setup)?.into()))
        .await?;

    wait_for_setup_complete(&mut ws_rx).await?;
    info!(model = %config.model, "Gemini Live session setup complete");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        while let Some(msg_result) = ws_rx.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => {
                    forward_frame(text.as_bytes(), &events_tx);
                }
                Ok(WsMessage::Binary(data)) => {
                    // The Live API delivers JSON payloads in binary frames.
                    forward_frame(&data, &events_tx);
                }
                Ok(WsMessage::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    debug!(?reason, "upstream closed the connection");
                    let _ = events_tx.send(LiveEvent::Closed(reason));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "error reading from upstream socket");
                    let _ = events_tx.send(LiveEvent::Error(e.to_string()));
                    return;
                }
            }
        }
        let _ = events_tx.send(LiveEvent::Closed(None));
    });

    let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&msg) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable client frame");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    Ok((
        LiveHandle {
            outbound,
            reader: Some(reader),
            writer: Some(writer),
        },
        events_rx,
    ))
}

fn forward_frame(payload: &[u8], events_tx: &mpsc::UnboundedSender<LiveEvent>) {
    let raw: RawServerMessage = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "failed to parse upstream frame, skipping");
            return;
        }
    };
    if let Some(go_away) = &raw.go_away {
        warn!(time_left = ?go_away.time_left, "upstream signaled goAway");
        return;
    }
    if let Some(event) = LiveEvent::from_raw(raw) {
        let _ = events_tx.send(event);
    }
}

async fn wait_for_setup_complete<S>(ws_rx: &mut S) -> Result<(), LiveError>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + SETUP_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| LiveError::SetupTimeout)?;
        let payload = match msg {
            Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(LiveError::Handshake(
                    frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed without reason".to_string()),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(LiveError::Handshake(e.to_string())),
            None => return Err(LiveError::ClosedDuringSetup),
        };
        match serde_json::from_slice::<RawServerMessage>(&payload) {
            Ok(raw) if raw.setup_complete.is_some() => return Ok(()),
            Ok(_) => {
                debug!("ignoring pre-setup frame from upstream");
            }
            Err(e) => {
                return Err(LiveError::Handshake(format!(
                    "unparseable frame during setup: {e}"
                )));
            }
        }
    }
}
