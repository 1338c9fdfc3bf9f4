//! Persistent-socket transport for the voice relay.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
