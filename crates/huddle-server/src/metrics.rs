//! Prometheus recorder and the relay's metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle `/metrics` renders from. Call once at startup; a
/// second call fails because a global recorder is already set.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "huddle_ws_connections_total";
/// WebSocket connections closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "huddle_ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "huddle_ws_connections_active";
/// Frames read from clients (counter).
pub const FRAMES_RECEIVED_TOTAL: &str = "huddle_frames_received_total";
/// Frames that failed to decode (counter, labels: error_kind).
pub const FRAMES_MALFORMED_TOTAL: &str = "huddle_frames_malformed_total";
/// Accepted joins (counter, labels: policy).
pub const JOINS_TOTAL: &str = "huddle_joins_total";
/// Chats fanned out to a room (counter).
pub const CHATS_RELAYED_TOTAL: &str = "huddle_chats_relayed_total";
/// Chat copies queued for a recipient (counter).
pub const DELIVERIES_TOTAL: &str = "huddle_deliveries_total";
/// Chat copies dropped on a full or closed queue (counter).
pub const DELIVERY_DROPS_TOTAL: &str = "huddle_delivery_drops_total";
/// Decoded messages that had no effect (counter, labels: reason).
pub const MESSAGES_IGNORED_TOTAL: &str = "huddle_messages_ignored_total";

/// Sum of every sample of `name` in Prometheus text output, across labels.
#[cfg(test)]
pub(crate) fn sample_sum(rendered: &str, name: &str) -> f64 {
    rendered
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let rest = line.strip_prefix(name)?;
            let value = if let Some(labelled) = rest.strip_prefix('{') {
                labelled.split_once("} ")?.1
            } else {
                rest.strip_prefix(' ')?
            };
            value.trim().parse::<f64>().ok()
        })
        .sum()
}
