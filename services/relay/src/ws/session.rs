//! Socket-transport connection handling: demultiplexes control frames from
//! binary audio and drives the session orchestrator.

use crate::{
    sink::ClientSink,
    state::AppState,
    ws::protocol::{ClientMessage, ServerMessage},
};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Axum handler to upgrade an HTTP connection to a voice socket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Push side of the socket transport, shared between the connection loop and
/// the session's background delivery/watchdog tasks.
pub struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send_event(&self, msg: ServerMessage) -> Result<()> {
        let payload = serde_json::to_string(&msg)?;
        self.tx.lock().await.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    async fn send_audio(&self, wav: Vec<u8>) -> Result<()> {
        self.tx.lock().await.send(Message::Binary(wav.into())).await?;
        Ok(())
    }
}

/// Main loop for one client connection. One socket owns at most one active
/// session at a time; when the socket goes away, so does its session.
#[instrument(name = "voice_socket", skip_all, fields(conn))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    tracing::Span::current().record("conn", conn);
    info!("new voice socket connected");

    let (socket_tx, mut socket_rx) = socket.split();
    let sink = Arc::new(WsSink::new(socket_tx));
    let mut active: Option<String> = None;

    while let Some(msg_result) = socket_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_control(&state, &sink, conn, &mut active, msg).await,
                Err(e) => {
                    // A bad frame must not tear the transport down.
                    warn!(error = %e, "unparseable control message, dropping");
                }
            },
            Ok(Message::Binary(data)) => {
                // Some clients mislabel control frames as binary; probe for
                // JSON before treating the payload as audio.
                if let Ok(msg) = serde_json::from_slice::<ClientMessage>(&data) {
                    handle_control(&state, &sink, conn, &mut active, msg).await;
                } else if let Some(session_id) = &active {
                    state
                        .orchestrator
                        .forward_audio(session_id, &data, None, Some(conn))
                        .await;
                } else {
                    warn!("binary frame with no active session, dropping");
                }
            }
            Ok(Message::Close(_)) => {
                info!("client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "error receiving from client socket");
                break;
            }
        }
    }

    // Transport-level close cancels the owning session even when no explicit
    // end message ever arrived; otherwise the upstream connection and queued
    // audio leak for every abandoned client.
    if let Some(session_id) = active {
        state
            .orchestrator
            .force_close(
                &session_id,
                Some(sink.as_ref() as &dyn ClientSink),
                "transport closed",
            )
            .await;
    }
    info!("voice socket closed");
}

async fn handle_control(
    state: &Arc<AppState>,
    sink: &Arc<WsSink>,
    conn: u64,
    active: &mut Option<String>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Start {
            session_id,
            sample_rate,
        } => {
            // A new start on a socket that already owns a session replaces it.
            if let Some(previous) = active.take() {
                state
                    .orchestrator
                    .force_close(
                        &previous,
                        Some(sink.as_ref() as &dyn ClientSink),
                        "superseded by new start",
                    )
                    .await;
            }

            let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            match state
                .orchestrator
                .start(&session_id, sample_rate, Some(conn))
                .await
            {
                Ok(session) => {
                    let delivery_sink: Arc<dyn ClientSink> = sink.clone();
                    state
                        .orchestrator
                        .attach_delivery(&session, delivery_sink.clone());
                    state.orchestrator.attach_watchdog(&session, Some(delivery_sink));
                    let _ = sink
                        .send_event(ServerMessage::SessionStarted {
                            session_id: session_id.clone(),
                        })
                        .await;
                    *active = Some(session_id);
                }
                Err(e) => {
                    let _ = sink.send_event(e.client_message()).await;
                }
            }
        }
        ClientMessage::End { session_id } => {
            if let Some(drained) = state.orchestrator.end(&session_id).await {
                for event in drained.events {
                    let _ = sink.send_event(event.into()).await;
                }
                if let Some(wav) = drained.wav {
                    let _ = sink.send_audio(wav).await;
                }
                let _ = sink
                    .send_event(ServerMessage::SessionEnded {
                        session_id: session_id.clone(),
                        reason: None,
                    })
                    .await;
            }
            if active.as_deref() == Some(session_id.as_str()) {
                *active = None;
            }
        }
    }
}
