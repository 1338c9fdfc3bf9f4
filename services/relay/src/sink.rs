//! Capability abstraction over push-capable client transports.

use crate::ws::protocol::ServerMessage;
use anyhow::Result;
use async_trait::async_trait;

/// What the session core needs from a transport to deliver results: a JSON
/// event channel and a binary audio channel. The WebSocket transport pushes
/// through this directly; the chunked-HTTP transport is pull-based and
/// returns drained results in its own response bodies instead.
#[async_trait]
pub trait ClientSink: Send + Sync + 'static {
    async fn send_event(&self, msg: ServerMessage) -> Result<()>;
    async fn send_audio(&self, wav: Vec<u8>) -> Result<()>;
}
