//! Shard-channel socket lifecycle
//!
//! Decoding happens at the edge: each connection task parses and validates
//! frames, answers protocol errors itself, and forwards good frames to the
//! owning cell actor. Outbound frames flow through a per-connection channel
//! drained by a writer task, so the actor never blocks on a slow socket.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::shard::{ShardHandle, ShardRegistry};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Run one shard-channel connection until the socket closes
pub async fn handle_socket(socket: WebSocket, cell_id: String, shards: ShardRegistry) {
    let connection_id = Uuid::new_v4();
    let shard = shards.handle(&cell_id);

    info!(cell_id = %cell_id, connection_id = %connection_id, "Shard channel opened");

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    if shard.attach(connection_id, tx.clone()).is_err() {
        warn!(cell_id = %cell_id, "Cell actor unavailable, dropping socket");
        return;
    }

    // Writer task: forwards queued frames to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sink, rx));

    let rate_limiter = ConnectionRateLimiter::new();

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_frame() {
                    warn!(connection_id = %connection_id, "Rate limited inbound frame");
                    continue;
                }
                handle_text_frame(&shard, connection_id, &tx, &text);
            }
            Ok(Message::Binary(_)) => {
                send_error(&tx, "binary frames are not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Transport-level liveness; axum answers pings itself
            }
            Ok(Message::Close(frame)) => {
                debug!(connection_id = %connection_id, reason = ?frame, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Socket receive error");
                break;
            }
        }
    }

    shard.closed(connection_id);
    writer_handle.abort();

    info!(cell_id = %cell_id, connection_id = %connection_id, "Shard channel closed");
}

fn handle_text_frame(shard: &ShardHandle, connection_id: Uuid, tx: &mpsc::UnboundedSender<Message>, text: &str) {
    match serde_json::from_str::<ClientMsg>(text) {
        Ok(msg) => match msg.validate() {
            Ok(()) => shard.inbound(connection_id, msg),
            Err(reason) => {
                debug!(connection_id = %connection_id, reason, "Rejected invalid frame");
                send_error(tx, reason);
            }
        },
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Failed to parse frame");
            send_error(tx, "malformed message");
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, message: &str) {
    let frame = ServerMsg::Error {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(json));
    }
}

/// Writer task: receives frames from the connection channel and forwards
/// them to the WebSocket sink until either side goes away.
async fn writer_task(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sink.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}
