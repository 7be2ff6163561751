//! PTY Broker (§4.7): per accepted streaming channel, resolves the target
//! instance, reserves a session id, attaches an interactive shell, and pumps
//! bytes between the client and the PTY until either side closes.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::orchestrator::Orchestrator;
use crate::scaffold::{ensure_scaffold_argv, shell_argv};
use crate::sessions::{SessionHandle, SessionKey, SessionRegistry, fresh_session_id};

/// Close code for a duplicate `sid` already attached to a live session (§6).
const CLOSE_DUPLICATE_SID: u16 = 4409;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub cid: String,
    pub sid: Option<String>,
}

/// Accepts an already-upgraded-pending `WebSocketUpgrade`; kept decoupled
/// from `AppState`/axum `State` extraction so the broker's dependencies are
/// just the two capabilities it actually needs (§9: "do not expose it as
/// free-floating state").
pub fn ws_upgrade(
    orchestrator: Arc<dyn Orchestrator>,
    sessions: Arc<SessionRegistry>,
    query: WsQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_channel(socket, orchestrator, sessions, query))
}

async fn handle_channel(
    mut socket: WebSocket,
    orchestrator: Arc<dyn Orchestrator>,
    sessions: Arc<SessionRegistry>,
    query: WsQuery,
) {
    let handle = match orchestrator.lookup(&query.cid).await {
        Ok(h) => h,
        Err(e) => {
            let _ = socket
                .send(Message::Text(json!({"error": e.to_string()}).to_string().into()))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let sid = query.sid.unwrap_or_else(fresh_session_id);
    let key: SessionKey = (handle.id.clone(), sid.clone());

    if sessions.insert_pending(key.clone()).await.is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_DUPLICATE_SID,
                reason: "duplicate session id".into(),
            })))
            .await;
        return;
    }

    // Authoritative-sid frame, sent before any PTY output (§4.7 step 4, §6).
    if socket
        .send(Message::Text(json!({ "sid": sid }).to_string().into()))
        .await
        .is_err()
    {
        sessions.remove(&key).await;
        return;
    }

    if let Err(e) = orchestrator.exec(&handle.id, &ensure_scaffold_argv()).await {
        tracing::warn!(instance = %handle.id, error = %e, "scaffold exec failed");
    }

    let attached = match orchestrator.attach(&handle.id, &shell_argv()).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(instance = %handle.id, error = %e, "attach failed");
            let _ = socket
                .send(Message::Text(json!({"error": e.to_string()}).to_string().into()))
                .await;
            sessions.remove(&key).await;
            return;
        }
    };

    sessions.attach(&key, SessionHandle::new(attached.writer)).await;
    let shared_writer = sessions.get(&key).await.expect("just attached").writer;

    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut pty_reader = attached.reader;

    // Egress pump: PTY -> client, lossy UTF-8, no framing beyond the
    // transport's own (§4.7 step 7). Isolated from the async scheduler on a
    // blocking-safe read loop — tokio's AsyncRead over the orchestrator's
    // attach stream already yields cooperatively, so no spawn_blocking is
    // needed here (unlike a raw OS PTY fd).
    let egress = async {
        let mut buf = [0u8; 1024];
        loop {
            match pty_reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = ws_sink.close().await;
    };

    // Ingress pump: client -> PTY, raw bytes, in order (§4.7 step 7, §5
    // Ordering guarantees (a)). Never holds a lock across the WS read.
    let ingress = async {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let mut writer = shared_writer.lock().await;
                    if writer.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    };

    // Run both pumps concurrently; teardown once either finishes (§4.7
    // step 8, §5 Cancellation).
    tokio::select! {
        _ = egress => {},
        _ = ingress => {},
    }

    sessions.remove(&key).await;
    tracing::info!(instance = %handle.id, sid = %sid, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_matches_wire_contract() {
        assert_eq!(CLOSE_DUPLICATE_SID, 4409);
    }
}
