//! Connection isolation, disconnect teardown and server shutdown.
#![cfg(unix)]

mod common;

use common::*;
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{protocol::frame::coding::CloseCode, Message};

fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn wait_until_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Start `sleep 30` as a one-shot and return its correlation id and pid.
async fn start_sleeper(tx: &mut WsTx, rx: &mut WsRx) -> (String, i32) {
    send_json(tx, json!({"type": "execute", "command": "sleep 30"})).await;
    let info = recv_json(rx).await;
    let process_id = info["processId"].as_str().unwrap().to_string();

    send_json(tx, json!({"type": "list"})).await;
    let list = recv_json(rx).await;
    let entry = list["processes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["id"] == process_id.as_str())
        .cloned()
        .unwrap();
    assert_eq!(entry["kind"], "transient");
    assert_eq!(entry["mode"], "pipe");
    assert_eq!(entry["command"], "sleep 30");
    (process_id, entry["pid"].as_i64().unwrap() as i32)
}

#[tokio::test]
async fn connections_cannot_touch_each_other() {
    let addr = start_server(test_context()).await;
    let (mut a_tx, mut a_rx, _) = connect_authed(addr).await;
    let (mut b_tx, mut b_rx, _) = connect_authed(addr).await;

    let (process_id, pid) = start_sleeper(&mut a_tx, &mut a_rx).await;

    send_json(&mut b_tx, json!({"type": "kill", "processId": process_id})).await;
    let reply = recv_json(&mut b_rx).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "process_not_found");

    send_json(&mut b_tx, json!({"type": "list"})).await;
    assert_eq!(recv_json(&mut b_rx).await["processes"], json!([]));

    send_json(&mut b_tx, json!({"type": "pause_response", "processId": process_id, "response": "y"})).await;
    assert_eq!(recv_json(&mut b_rx).await["code"], "not_paused");

    assert!(process_alive(pid));

    send_json(&mut a_tx, json!({"type": "kill", "processId": process_id})).await;
    let messages = recv_until_type(&mut a_rx, "close").await;
    assert!(messages
        .iter()
        .any(|m| m["type"] == "info" && m["message"] == "killed"));
    assert_eq!(messages.last().unwrap()["signal"], "SIGTERM");
    assert!(wait_until_gone(pid).await);
}

async fn first_pid(tx: &mut WsTx, rx: &mut WsRx) -> i32 {
    send_json(tx, json!({"type": "list"})).await;
    recv_reply(rx).await["processes"][0]["pid"].as_i64().unwrap() as i32
}

#[tokio::test]
async fn terminal_ids_are_per_connection() {
    let addr = start_server(test_context()).await;
    let (mut a_tx, mut a_rx, _) = connect_authed(addr).await;
    let (mut b_tx, mut b_rx, _) = connect_authed(addr).await;

    send_json(&mut a_tx, json!({"type": "create_terminal", "terminalId": "t1"})).await;
    assert_eq!(recv_reply(&mut a_rx).await["type"], "terminal_ready");
    let before = first_pid(&mut a_tx, &mut a_rx).await;

    send_json(&mut b_tx, json!({"type": "close_terminal", "terminalId": "t1"})).await;
    assert_eq!(recv_json(&mut b_rx).await["code"], "terminal_not_found");

    send_json(&mut b_tx, json!({"type": "terminal-input", "terminalId": "t1", "input": "exit\n"})).await;
    assert_eq!(recv_json(&mut b_rx).await["code"], "not_ready");

    send_json(&mut b_tx, json!({"type": "terminal-resize", "terminalId": "t1", "cols": 10, "rows": 5})).await;
    send_json(&mut b_tx, json!({"type": "kill", "processId": "t1"})).await;
    // the resize is a silent no-op, so the next reply is the kill's
    assert_eq!(recv_json(&mut b_rx).await["code"], "process_not_found");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(process_alive(before));
    assert_eq!(first_pid(&mut a_tx, &mut a_rx).await, before);
}

#[tokio::test]
async fn disconnect_kills_everything_owned() {
    let ctx = test_context();
    let addr = start_server(ctx.clone()).await;
    let (mut tx, mut rx, _) = connect_authed(addr).await;

    let (_, sleeper) = start_sleeper(&mut tx, &mut rx).await;

    send_json(&mut tx, json!({"type": "create_terminal", "terminalId": "t1"})).await;
    assert_eq!(recv_reply(&mut rx).await["type"], "terminal_ready");
    send_json(&mut tx, json!({"type": "list"})).await;
    let list = recv_reply(&mut rx).await;
    let shell = list["processes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["kind"] == "persistent")
        .and_then(|p| p["pid"].as_i64())
        .unwrap() as i32;

    drop(tx);
    drop(rx);

    assert!(wait_until_gone(sleeper).await, "one-shot survived disconnect");
    assert!(wait_until_gone(shell).await, "terminal shell survived disconnect");
    assert_eq!(ctx.connection_count(), 0);
    assert_eq!(ctx.auth().authenticated_count(), 0);
}

#[tokio::test]
async fn reconnect_starts_unauthenticated() {
    let addr = start_server(test_context()).await;
    let (tx, rx, first) = connect_authed(addr).await;
    drop((tx, rx));

    let (mut tx, mut rx, second) = connect(addr).await;
    assert_ne!(first, second);
    send_json(&mut tx, json!({"type": "list"})).await;
    assert_eq!(recv_json(&mut rx).await["type"], "auth-required");
}

#[tokio::test]
async fn shutdown_sends_close_frame_and_tears_down() {
    let ctx = test_context();
    let addr = start_server(ctx.clone()).await;
    let (mut tx, mut rx, _) = connect_authed(addr).await;
    let (_, pid) = start_sleeper(&mut tx, &mut rx).await;

    ctx.shutdown_token().cancel();

    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("no close frame");
    assert_eq!(frame.map(|f| f.code), Some(CloseCode::Normal));

    ctx.shutdown_all();
    assert!(wait_until_gone(pid).await);
    assert_eq!(ctx.connection_count(), 0);
}

#[tokio::test]
async fn kill_on_terminal_command_interrupts_foreground() {
    let addr = start_server(test_context()).await;
    let (mut tx, mut rx, _) = connect_authed(addr).await;

    send_json(&mut tx, json!({"type": "execute", "command": "sleep 30", "terminalId": "t1"})).await;
    let info = recv_reply(&mut rx).await;
    assert_eq!(info["message"], "executing: sleep 30");
    let process_id = info["processId"].as_str().unwrap().to_string();
    // let the shell get sleep into the foreground
    tokio::time::sleep(Duration::from_millis(300)).await;

    send_json(&mut tx, json!({"type": "kill", "processId": process_id})).await;
    let reply = recv_reply(&mut rx).await;
    assert_eq!(reply["message"], "killed");

    // the shell survives and still answers
    send_json(&mut tx, json!({"type": "terminal-input", "terminalId": "t1", "input": "echo ALIVE_$((1+1))\n"})).await;
    let mut output = String::new();
    while !output.contains("ALIVE_2") {
        let msg = recv_json(&mut rx).await;
        assert_ne!(msg["type"], "terminal-exit");
        if msg["type"] == "terminal-output" {
            output.push_str(msg["data"].as_str().unwrap());
        }
    }
}
