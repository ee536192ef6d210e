//! One WebSocket client from upgrade to disconnect.
//!
//! The socket is split: a writer task drains the connection's outbound
//! queue onto the wire (plus periodic pings), while the reader decodes
//! frames in arrival order and hands them to the router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use huddle_core::{ConnectionId, InboundMessage, OutboundMessage, ProtocolError};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use super::connection::ClientConnection;
use crate::metrics::{
    FRAMES_MALFORMED_TOTAL, FRAMES_RECEIVED_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::registry::RoomRegistry;
use crate::router::{MessageRouter, RouteOutcome};

/// How long the writer gets to flush and send its close frame.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub router: Arc<MessageRouter>,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Removes the connection from the registry when the session ends, however
/// it ends.
struct MembershipGuard {
    registry: Arc<RoomRegistry>,
    conn_id: ConnectionId,
}

impl Drop for MembershipGuard {
    fn drop(&mut self) {
        let removed = self.registry.remove(&self.conn_id);
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        info!(
            conn_id = %self.conn_id,
            memberships_removed = removed,
            remaining_memberships = self.registry.len(),
            connections = self.registry.connection_count(),
            "client disconnected"
        );
    }
}

/// Drive one upgraded socket until either side goes away or the server
/// shuts down.
pub async fn run_session(socket: WebSocket, ctx: SessionContext) {
    let (connection, rx) = ClientConnection::with_queue(ctx.max_send_queue);
    let span = tracing::info_span!(
        "session",
        conn_id = %connection.id(),
        room_id = tracing::field::Empty
    );
    drive(socket, connection, rx, ctx).instrument(span).await;
}

async fn drive(
    socket: WebSocket,
    connection: Arc<ClientConnection>,
    rx: mpsc::Receiver<Arc<OutboundMessage>>,
    ctx: SessionContext,
) {
    let registry = Arc::clone(ctx.router.registry());
    registry.register(&connection);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let _guard = MembershipGuard {
        registry: Arc::clone(&registry),
        conn_id: connection.id().clone(),
    };
    info!(connections = registry.connection_count(), "client connected");

    let (ws_tx, ws_rx) = socket.split();
    let stop = ctx.shutdown.child_token();
    let mut writer = tokio::spawn(
        write_loop(ws_tx, rx, ctx.heartbeat_interval, stop.clone()).instrument(tracing::Span::current()),
    );

    let writer_finished = tokio::select! {
        _ = &mut writer => {
            debug!("writer finished");
            true
        }
        () = read_loop(ws_rx, &connection, &ctx.router) => {
            debug!("reader finished");
            false
        }
        () = ctx.shutdown.cancelled() => {
            debug!("server shutting down");
            false
        }
    };

    if !writer_finished {
        stop.cancel();
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut writer).await.is_err() {
            debug!("writer did not close in time");
            writer.abort();
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<OutboundMessage>>,
    heartbeat_interval: Duration,
    stop: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(heartbeat_interval);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    debug!(error = %e, "write failed");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
        }
    }
    // Flushes any pending close reply and sends our own close frame.
    let _ = ws_tx.close().await;
}

async fn read_loop(mut ws_rx: SplitStream<WebSocket>, connection: &Arc<ClientConnection>, router: &MessageRouter) {
    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "websocket error");
                break;
            }
        };
        let decoded = match frame {
            WsMessage::Text(text) => InboundMessage::decode(text.as_str()),
            WsMessage::Binary(bytes) => InboundMessage::decode_bytes(&bytes),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        handle_frame(router, connection, decoded);
    }
}

/// Route one decoded frame. Undecodable frames are logged and dropped
/// without touching the connection.
fn handle_frame(
    router: &MessageRouter,
    connection: &Arc<ClientConnection>,
    decoded: Result<InboundMessage, ProtocolError>,
) -> Option<RouteOutcome> {
    counter!(FRAMES_RECEIVED_TOTAL).increment(1);
    match decoded {
        Ok(message) => {
            let kind = message.kind();
            let outcome = router.route(connection, message);
            trace!(kind, ?outcome, "routed");
            Some(outcome)
        }
        Err(e) => {
            counter!(FRAMES_MALFORMED_TOTAL, "error_kind" => e.error_kind()).increment(1);
            warn!(error_kind = e.error_kind(), error = %e, "dropping undecodable frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoinPolicy;
    use crate::metrics::sample_sum;
    use huddle_core::RoomId;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(RoomRegistry::new()), JoinPolicy::Replace)
    }

    #[test]
    fn undecodable_frame_is_counted_and_connection_keeps_working() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let router = router();
        let (a, _a_rx) = ClientConnection::with_queue(8);
        let (b, mut b_rx) = ClientConnection::with_queue(8);

        metrics::with_local_recorder(&recorder, || {
            handle_frame(&router, &a, InboundMessage::decode(r#"{"type":"join","payload":{"roomId":"R1"}}"#));
            handle_frame(&router, &b, InboundMessage::decode(r#"{"type":"join","payload":{"roomId":"R1"}}"#));
            assert!(handle_frame(&router, &a, InboundMessage::decode("not json")).is_none());
            assert!(handle_frame(&router, &a, InboundMessage::decode_bytes(&[0xff, 0xfe])).is_none());
            let outcome = handle_frame(&router, &a, InboundMessage::decode(r#"{"type":"chat","payload":{"message":"ok"}}"#));
            assert!(matches!(outcome, Some(RouteOutcome::Relayed { delivered: 1, .. })));
        });

        let rendered = handle.render();
        assert_eq!(sample_sum(&rendered, FRAMES_RECEIVED_TOTAL), 5.0);
        assert_eq!(sample_sum(&rendered, FRAMES_MALFORMED_TOTAL), 2.0);
        assert!(rendered.contains(r#"error_kind="invalid_utf8""#), "{rendered}");
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn guard_purges_connection_exactly_once() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let registry = Arc::new(RoomRegistry::new());
        let (a, _a_rx) = ClientConnection::with_queue(8);
        let (b, _b_rx) = ClientConnection::with_queue(8);
        registry.register(&a);
        registry.register(&b);
        registry.add(&a, RoomId::parse("R1").unwrap());
        registry.add(&b, RoomId::parse("R1").unwrap());

        metrics::with_local_recorder(&recorder, || {
            drop(MembershipGuard {
                registry: Arc::clone(&registry),
                conn_id: a.id().clone(),
            });
        });

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.find_room(a.id()).is_none());
        assert_eq!(sample_sum(&handle.render(), WS_DISCONNECTIONS_TOTAL), 1.0);
    }
}
