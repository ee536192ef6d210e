//! Join handling and room-scoped chat fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_core::{ChatPayload, InboundMessage, JoinPayload, OutboundMessage, RoomId};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::JoinPolicy;
use crate::metrics::{
    CHATS_RELAYED_TOTAL, DELIVERIES_TOTAL, DELIVERY_DROPS_TOTAL, JOINS_TOTAL, MESSAGES_IGNORED_TOTAL,
};
use crate::registry::RoomRegistry;
use crate::websocket::connection::ClientConnection;

/// Why a decoded message had no effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `join` with no or empty `roomId`.
    MissingRoomId,
    /// `chat` with no or empty `message`.
    EmptyMessage,
    /// `chat` from a connection that never joined.
    NotInRoom,
    /// `join` refused under [`JoinPolicy::KeepFirst`].
    AlreadyJoined(RoomId),
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRoomId => "missing_room_id",
            Self::EmptyMessage => "empty_message",
            Self::NotInRoom => "not_in_room",
            Self::AlreadyJoined(_) => "already_joined",
        }
    }
}

/// What routing one message did. Never reported to the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Joined {
        room_id: RoomId,
        /// Room the connection left, under [`JoinPolicy::Replace`].
        left: Option<RoomId>,
    },
    Relayed {
        room_id: RoomId,
        delivered: usize,
        dropped: usize,
    },
    Ignored(IgnoreReason),
}

/// Interprets inbound messages against the shared [`RoomRegistry`].
pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
    policy: JoinPolicy,
}

impl MessageRouter {
    pub fn new(registry: Arc<RoomRegistry>, policy: JoinPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> JoinPolicy {
        self.policy
    }

    pub fn route(&self, sender: &Arc<ClientConnection>, message: InboundMessage) -> RouteOutcome {
        self.route_at(sender, message, Utc::now())
    }

    /// Like [`route`](Self::route) with an explicit clock reading, stamped on
    /// every delivery of a chat.
    pub fn route_at(&self, sender: &Arc<ClientConnection>, message: InboundMessage, now: DateTime<Utc>) -> RouteOutcome {
        let outcome = match message {
            InboundMessage::Join(payload) => self.join(sender, payload),
            InboundMessage::Chat(payload) => self.chat(sender, payload, now),
        };
        if let RouteOutcome::Ignored(reason) = &outcome {
            counter!(MESSAGES_IGNORED_TOTAL, "reason" => reason.as_str()).increment(1);
            debug!(conn_id = %sender.id(), reason = reason.as_str(), "message ignored");
        }
        outcome
    }

    fn join(&self, sender: &Arc<ClientConnection>, payload: JoinPayload) -> RouteOutcome {
        let Some(room_id) = payload.room_id.and_then(RoomId::parse) else {
            return RouteOutcome::Ignored(IgnoreReason::MissingRoomId);
        };

        let left = match self.policy {
            JoinPolicy::Replace => self.registry.replace(sender, room_id.clone()),
            JoinPolicy::KeepFirst => {
                if let Err(existing) = self.registry.add_if_absent(sender, room_id.clone()) {
                    return RouteOutcome::Ignored(IgnoreReason::AlreadyJoined(existing));
                }
                None
            }
            JoinPolicy::Append => {
                self.registry.add(sender, room_id.clone());
                None
            }
        };

        counter!(JOINS_TOTAL, "policy" => self.policy.as_str()).increment(1);
        tracing::Span::current().record("room_id", room_id.as_str());
        info!(
            conn_id = %sender.id(),
            room_id = %room_id,
            left = left.as_ref().map(RoomId::as_str),
            memberships = self.registry.len(),
            "client joined room"
        );
        RouteOutcome::Joined { room_id, left }
    }

    fn chat(&self, sender: &Arc<ClientConnection>, payload: ChatPayload, now: DateTime<Utc>) -> RouteOutcome {
        let text = match payload.message {
            Some(text) if !text.is_empty() => text,
            _ => return RouteOutcome::Ignored(IgnoreReason::EmptyMessage),
        };
        let Some(room_id) = self.registry.find_room(sender.id()) else {
            return RouteOutcome::Ignored(IgnoreReason::NotInRoom);
        };

        // Snapshot taken; the registry lock is already released here.
        let recipients = self.registry.members_of(&room_id, sender.id());
        let message = Arc::new(OutboundMessage::chat(text, room_id.clone(), now));

        let mut delivered = 0;
        let mut dropped = 0;
        for recipient in &recipients {
            if recipient.send(Arc::clone(&message)) {
                delivered += 1;
            } else {
                dropped += 1;
                warn!(
                    conn_id = %recipient.id(),
                    room_id = %room_id,
                    "recipient queue full or closed, dropping chat"
                );
            }
        }

        counter!(CHATS_RELAYED_TOTAL).increment(1);
        counter!(DELIVERIES_TOTAL).increment(delivered as u64);
        counter!(DELIVERY_DROPS_TOTAL).increment(dropped as u64);
        debug!(
            conn_id = %sender.id(),
            room_id = %room_id,
            recipients = recipients.len(),
            delivered,
            dropped,
            "chat relayed"
        );
        RouteOutcome::Relayed {
            room_id,
            delivered,
            dropped,
        }
    }
}
