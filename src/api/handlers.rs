use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, Flow};
use crate::context::ServerContext;
use crate::protocol::{Envelope, Outbox};

use super::OUTBOX_CAPACITY;

/// How long the writer gets to flush queued messages once the socket is done.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<ServerContext>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, ctx))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Why the reader loop ended.
enum Ending {
    ClientGone,
    Shutdown,
    Policy,
}

async fn handle_ws(socket: WebSocket, ctx: ServerContext) {
    let shutdown = ctx.shutdown_token();
    if shutdown.is_cancelled() {
        return;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let (outbox, out_rx) = Outbox::channel(OUTBOX_CAPACITY);
    let conn = Connection::open(ctx, outbox);

    // The writer runs on its own task so a dispatcher waiting on a full
    // outbox never stops the queue from draining.
    let stop = CancellationToken::new();
    let writer = tokio::spawn(write_loop(ws_tx, out_rx, stop.clone()));

    conn.welcome().await;

    let ending = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ending) = dispatch(&conn, text.as_str(), &shutdown).await {
                            break ending;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Some(ending) = dispatch(&conn, text, &shutdown).await {
                                break ending;
                            }
                        }
                        Err(_) => tracing::debug!(conn = conn.id(), "ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break Ending::ClientGone,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(conn = conn.id(), "websocket error: {e}");
                        break Ending::ClientGone;
                    }
                }
            }

            _ = shutdown.cancelled() => break Ending::Shutdown,
        }
    };

    let conn_id = conn.id().to_string();
    conn.close();

    stop.cancel();
    let ws_tx = match tokio::time::timeout(WRITER_DRAIN, writer).await {
        Ok(Ok(Some(ws_tx))) => ws_tx,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::warn!(conn = %conn_id, "websocket writer task failed: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!(conn = %conn_id, "websocket writer did not drain in time");
            return;
        }
    };

    let frame = match ending {
        Ending::ClientGone => return,
        Ending::Shutdown => CloseFrame {
            code: close_code::NORMAL,
            reason: "server shutting down".into(),
        },
        Ending::Policy => CloseFrame {
            code: close_code::POLICY,
            reason: "too many failed authentication attempts".into(),
        },
    };
    send_close(ws_tx, frame).await;
}

/// Handle one frame, giving up on it if the server starts shutting down.
async fn dispatch(conn: &Connection, text: &str, shutdown: &CancellationToken) -> Option<Ending> {
    tokio::select! {
        flow = conn.handle_text(text) => (flow == Flow::Close).then_some(Ending::Policy),
        _ = shutdown.cancelled() => Some(Ending::Shutdown),
    }
}

/// Forward queued envelopes until `stop`, then flush what is left. Hands the
/// sink back unless the socket failed.
async fn write_loop(
    mut ws_tx: WsSink,
    mut out_rx: mpsc::Receiver<Envelope>,
    stop: CancellationToken,
) -> Option<WsSink> {
    loop {
        tokio::select! {
            biased;

            env = out_rx.recv() => {
                let Some(env) = env else { break };
                if !send_envelope(&mut ws_tx, &env).await {
                    return None;
                }
            }

            _ = stop.cancelled() => break,
        }
    }
    while let Ok(env) = out_rx.try_recv() {
        if !send_envelope(&mut ws_tx, &env).await {
            return None;
        }
    }
    Some(ws_tx)
}

async fn send_envelope(ws_tx: &mut WsSink, env: &Envelope) -> bool {
    match env.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("failed to serialize outbound message: {e}");
            true
        }
    }
}

async fn send_close(mut ws_tx: WsSink, frame: CloseFrame) {
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}
