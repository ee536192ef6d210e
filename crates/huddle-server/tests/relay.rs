//! End-to-end relay tests using real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use huddle_server::{JoinPolicy, ServerConfig, ServerHandle};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_server(join_policy: JoinPolicy) -> ServerHandle {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        heartbeat_interval_secs: 3600,
        join_policy,
        ..Default::default()
    };
    huddle_server::start(config, PrometheusBuilder::new().build_recorder().handle())
        .await
        .unwrap()
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let url = format!("ws://127.0.0.1:{}/ws", handle.port());
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn join(ws: &mut WsStream, room: &str) {
    send_json(ws, json!({"type": "join", "payload": {"roomId": room}})).await;
}

async fn chat(ws: &mut WsStream, text: &str) {
    send_json(ws, json!({"type": "chat", "payload": {"message": text}})).await;
}

/// Next text frame as JSON, skipping control frames.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut WsStream) {
    let deadline = tokio::time::Instant::now() + QUIET;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

async fn wait_for_memberships(handle: &ServerHandle, expected: usize) {
    for _ in 0..100 {
        if handle.registry().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} memberships, registry has {}",
        handle.registry().len()
    );
}

async fn wait_for_open_connections(handle: &ServerHandle, expected: usize) {
    for _ in 0..100 {
        if handle.registry().connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} open connections, registry has {}",
        handle.registry().connection_count()
    );
}

#[tokio::test]
async fn chat_reaches_other_member_of_room() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    wait_for_memberships(&server, 2).await;

    chat(&mut alice, "hi").await;
    let msg = read_json(&mut bob).await;
    assert_eq!(msg["type"], "chat");
    assert_eq!(msg["message"], "hi");
    assert_eq!(msg["roomId"], "R1");
    let ts = msg["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");

    assert_silent(&mut alice).await;
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let mut carol = connect(&server).await;

    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    join(&mut carol, "R2").await;
    wait_for_memberships(&server, 3).await;

    chat(&mut alice, "only R1").await;
    assert_eq!(read_json(&mut bob).await["message"], "only R1");
    assert_silent(&mut carol).await;

    chat(&mut carol, "alone").await;
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn chat_before_join_goes_nowhere() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut lurker = connect(&server).await;
    let mut member = connect(&server).await;
    join(&mut member, "R1").await;
    wait_for_memberships(&server, 1).await;

    chat(&mut lurker, "anyone?").await;
    assert_silent(&mut member).await;

    // The connection is still usable afterwards.
    join(&mut lurker, "R1").await;
    wait_for_memberships(&server, 2).await;
    chat(&mut lurker, "now?").await;
    assert_eq!(read_json(&mut member).await["message"], "now?");
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn fan_out_reaches_everyone_but_sender() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut ws = connect(&server).await;
        join(&mut ws, "lobby").await;
        clients.push(ws);
    }
    wait_for_memberships(&server, 4).await;

    chat(&mut clients[2], "hello all").await;
    for (i, ws) in clients.iter_mut().enumerate() {
        if i == 2 {
            assert_silent(ws).await;
        } else {
            assert_eq!(read_json(ws).await["message"], "hello all");
        }
    }
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn disconnect_purges_membership() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    wait_for_memberships(&server, 2).await;

    alice.close(None).await.unwrap();
    wait_for_memberships(&server, 1).await;
    wait_for_open_connections(&server, 1).await;

    chat(&mut bob, "still here?").await;
    assert_silent(&mut bob).await;
    assert_eq!(server.registry().room_count(), 1);

    drop(bob);
    wait_for_memberships(&server, 0).await;
    assert_eq!(server.registry().room_count(), 0);
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    wait_for_memberships(&server, 2).await;

    alice.send(Message::text("not json")).await.unwrap();
    send_json(&mut alice, json!({"type": "shout", "payload": {}})).await;
    send_json(&mut alice, json!({"type": "chat", "payload": {"message": ""}})).await;
    chat(&mut alice, "after garbage").await;

    assert_eq!(read_json(&mut bob).await["message"], "after garbage");
    assert_silent(&mut bob).await;
    assert_eq!(server.registry().connection_count(), 2);
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn client_close_is_answered_with_close_frame() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    join(&mut alice, "R1").await;
    wait_for_memberships(&server, 1).await;

    alice.close(None).await.unwrap();
    let answered = timeout(TIMEOUT, async {
        loop {
            match alice.next().await {
                Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
                None | Some(Err(_)) => return false,
            }
        }
    })
    .await;
    assert_eq!(answered, Ok(true), "server did not answer the close handshake");

    wait_for_open_connections(&server, 0).await;
    assert!(server.registry().is_empty());
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn binary_frames_are_decoded_as_text() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    wait_for_memberships(&server, 2).await;

    let frame = json!({"type": "chat", "payload": {"message": "bytes"}}).to_string();
    alice.send(Message::binary(frame.into_bytes())).await.unwrap();
    assert_eq!(read_json(&mut bob).await["message"], "bytes");
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    join(&mut alice, "R1").await;
    join(&mut bob, "R1").await;
    wait_for_memberships(&server, 2).await;

    for i in 0..20 {
        chat(&mut alice, &format!("m{i}")).await;
    }
    for i in 0..20 {
        assert_eq!(read_json(&mut bob).await["message"], format!("m{i}"));
    }
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn replace_policy_moves_client_between_rooms() {
    let server = boot_server(JoinPolicy::Replace).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let mut carol = connect(&server).await;
    join(&mut bob, "R1").await;
    join(&mut carol, "R2").await;
    join(&mut alice, "R1").await;
    wait_for_memberships(&server, 3).await;

    join(&mut alice, "R2").await;
    chat(&mut alice, "moved").await;
    assert_eq!(read_json(&mut carol).await["roomId"], "R2");
    assert_silent(&mut bob).await;
    assert_eq!(server.registry().len(), 3);
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn append_policy_routes_to_first_room() {
    let server = boot_server(JoinPolicy::Append).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let mut carol = connect(&server).await;
    join(&mut bob, "R1").await;
    join(&mut carol, "R2").await;
    join(&mut alice, "R1").await;
    join(&mut alice, "R2").await;
    wait_for_memberships(&server, 4).await;

    chat(&mut alice, "first room").await;
    assert_eq!(read_json(&mut bob).await["roomId"], "R1");
    assert_silent(&mut carol).await;
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn health_reports_live_counts() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    let _idle = connect(&server).await;
    join(&mut alice, "R1").await;
    wait_for_memberships(&server, 1).await;
    wait_for_open_connections(&server, 2).await;

    let url = format!("http://127.0.0.1:{}/health", server.port());
    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 2);
    assert_eq!(body["memberships"], 1);
    assert_eq!(body["rooms"], 1);
    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let server = boot_server(JoinPolicy::default()).await;
    let mut alice = connect(&server).await;
    join(&mut alice, "R1").await;
    wait_for_memberships(&server, 1).await;

    let registry = Arc::clone(server.registry());
    server.shutdown(TIMEOUT).await;

    let purged = timeout(TIMEOUT, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(purged.is_ok(), "memberships survived shutdown");

    let ended = timeout(TIMEOUT, async {
        loop {
            match alice.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client was not disconnected");
}
