//! Voice Relay Library Crate
//!
//! A duplex audio relay between browser clients and the Gemini Live
//! speech-to-speech endpoint. Clients talk to the relay over either a
//! persistent WebSocket or discrete chunked-HTTP calls; both transports
//! drive the same session core (registry, orchestrator, turn reassembly,
//! WAV encoding). The `relay` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod session;
pub mod sink;
pub mod state;
pub mod wav;
pub mod ws;
