#![allow(dead_code)]

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use shellgate::{api, config::GatewayConfig, context::ServerContext};

pub const KEY: &str = "test-key";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsTx = SplitSink<WsStream, Message>;
pub type WsRx = SplitStream<WsStream>;

/// A context rooted in a temp dir, running `/bin/sh` for terminals.
pub fn test_context() -> ServerContext {
    let config = GatewayConfig {
        shell: "/bin/sh".into(),
        default_cwd: std::env::temp_dir(),
        max_auth_failures: 3,
        ..GatewayConfig::default()
    };
    ServerContext::new(config, KEY)
}

pub async fn start_server(ctx: ServerContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(ctx);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Open `/ws` and consume the welcome message.
pub async fn connect(addr: SocketAddr) -> (WsTx, WsRx, String) {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (tx, mut rx) = ws.split();
    let welcome = recv_json(&mut rx).await;
    assert_eq!(welcome["type"], "info");
    assert_eq!(welcome["message"], "connected");
    let conn = welcome["connectionId"].as_str().unwrap().to_string();
    (tx, rx, conn)
}

/// Connect and authenticate.
pub async fn connect_authed(addr: SocketAddr) -> (WsTx, WsRx, String) {
    let (mut tx, mut rx, conn) = connect(addr).await;
    send_json(&mut tx, serde_json::json!({"type": "authenticate", "key": KEY})).await;
    let reply = recv_json(&mut rx).await;
    assert_eq!(reply["type"], "auth-success", "{reply}");
    (tx, rx, conn)
}

pub async fn send_json(tx: &mut WsTx, value: serde_json::Value) {
    tx.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Receive the next text message, parsed as JSON.
pub async fn recv_json(rx: &mut WsRx) -> serde_json::Value {
    let deadline = Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout(deadline, rx.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Receive messages until one has `type == kind`; returns everything seen,
/// that one last.
pub async fn recv_until_type(rx: &mut WsRx, kind: &str) -> Vec<serde_json::Value> {
    let mut seen = Vec::new();
    loop {
        let msg = recv_json(rx).await;
        let done = msg["type"] == kind;
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

/// Like [`recv_json`] but skips terminal output.
pub async fn recv_reply(rx: &mut WsRx) -> serde_json::Value {
    loop {
        let msg = recv_json(rx).await;
        if msg["type"] != "terminal-output" {
            return msg;
        }
    }
}

/// Try to receive a JSON message within `timeout`.
pub async fn try_recv_json(rx: &mut WsRx, timeout: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(timeout, rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

/// Concatenated `data` of every message of type `kind`.
pub fn data_of(messages: &[serde_json::Value], kind: &str) -> String {
    messages
        .iter()
        .filter(|m| m["type"] == kind)
        .filter_map(|m| m["data"].as_str())
        .collect()
}
