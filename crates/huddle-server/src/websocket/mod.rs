//! WebSocket transport: connection handles and per-client sessions.

pub mod connection;
pub mod session;
