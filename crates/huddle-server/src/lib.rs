//! # huddle-server
//!
//! WebSocket chat relay. Clients join a named room and every chat they send
//! is fanned out to the other members of that room.
//!
//! - [`registry`] tracks which connection is in which room
//! - [`router`] applies join and chat messages against the registry
//! - [`websocket`] owns the per-connection socket tasks
//! - [`server`] wires the Axum routes together and manages shutdown
//! - [`metrics`] names the Prometheus series the relay records

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod websocket;

pub use config::{JoinPolicy, ServerConfig};
pub use errors::ServerError;
pub use registry::RoomRegistry;
pub use router::{MessageRouter, RouteOutcome};
pub use server::{start, ServerHandle};
