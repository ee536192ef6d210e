//! # huddle-core
//!
//! Shared identifiers and the JSON wire protocol spoken between relay
//! clients and the server.

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::ProtocolError;
pub use ids::{ConnectionId, RoomId};
pub use protocol::{ChatDelivery, ChatPayload, InboundMessage, JoinPayload, OutboundMessage};
