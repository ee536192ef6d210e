//! Server configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What a `join` does when the connection already belongs to a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Leave the previous room and enter the new one (last join wins).
    #[default]
    Replace,
    /// Ignore joins while a membership is active (first join wins).
    KeepFirst,
    /// Accumulate memberships; chat is routed to the earliest one.
    Append,
}

impl JoinPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::KeepFirst => "keep-first",
            Self::Append => "append",
        }
    }
}

impl fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown join policy {0:?} (expected replace, keep-first or append)")]
pub struct UnknownJoinPolicy(String);

impl FromStr for JoinPolicy {
    type Err = UnknownJoinPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "keep-first" | "keep_first" => Ok(Self::KeepFirst),
            "append" => Ok(Self::Append),
            _ => Err(UnknownJoinPolicy(s.to_string())),
        }
    }
}

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Capacity of each connection's outbound queue.
    pub max_send_queue: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    pub join_policy: JoinPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            max_message_size: 64 * 1024,
            join_policy: JoinPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Raise zero queue, heartbeat and frame-size settings to 1.
    ///
    /// A zero queue or interval would panic in tokio, and a zero frame limit
    /// would reject every message.
    pub fn normalized(mut self) -> Self {
        if self.max_send_queue == 0 {
            warn!("max_send_queue of 0 raised to 1");
            self.max_send_queue = 1;
        }
        if self.heartbeat_interval_secs == 0 {
            warn!("heartbeat_interval_secs of 0 raised to 1");
            self.heartbeat_interval_secs = 1;
        }
        if self.max_message_size == 0 {
            warn!("max_message_size of 0 raised to 1");
            self.max_message_size = 1;
        }
        self
    }
}
