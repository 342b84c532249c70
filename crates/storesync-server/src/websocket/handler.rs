//! Per-socket task: a writer draining the connection's queue and a reader
//! feeding the router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::connection::Outbound;
use super::router::MessageRouter;

/// How long a closed connection may keep flushing frames to its peer.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Drive one upgraded socket until either side closes it.
#[instrument(skip_all, name = "ws_connection")]
pub async fn handle_socket(socket: WebSocket, router: Arc<MessageRouter>) {
    let (connection, rx) = router.on_connect();
    let conn_id = connection.id().clone();
    let token = connection.closed_token();
    let (ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(write_loop(ws_tx, rx, token.clone()));

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = router.on_message(&conn_id, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!(conn_id = %conn_id, "pong frame");
                        router.on_pong(&conn_id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            () = token.cancelled() => break,
        }
    }

    router.on_disconnect(&conn_id);
    if time::timeout(CLOSE_GRACE * 2, &mut writer).await.is_err() {
        warn!(conn_id = %conn_id, "writer did not stop, aborting");
        writer.abort();
    }
}

/// Forward queued frames to the socket in order.
///
/// Queued frames win over cancellation, so a Close frame queued by an
/// eviction is written before the loop exits. Once the connection is closed,
/// a send still blocked on a peer that stopped reading gets [`CLOSE_GRACE`]
/// and is then abandoned.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            () = token.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        let delivered = match frame {
            Outbound::Text(json) => {
                send_until_closed(&mut ws_tx, Message::Text(json.to_string().into()), &token).await
            }
            Outbound::Probe(json) => {
                send_until_closed(&mut ws_tx, Message::Ping(vec![].into()), &token).await
                    && send_until_closed(&mut ws_tx, Message::Text(json.to_string().into()), &token)
                        .await
            }
            Outbound::Close(reason) => {
                let frame = Message::Close(Some(CloseFrame {
                    code: reason.code,
                    reason: Utf8Bytes::from_static(reason.reason),
                }));
                let _ = send_until_closed(&mut ws_tx, frame, &token).await;
                break;
            }
        };
        if !delivered {
            break;
        }
    }

    token.cancel();
    let _ = time::timeout(CLOSE_GRACE, ws_tx.close()).await;
}

/// Send one frame. Returns `false` if the send failed, or if the connection
/// was closed and the peer did not take the frame within [`CLOSE_GRACE`].
async fn send_until_closed(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: Message,
    token: &CancellationToken,
) -> bool {
    let grace_expired = async {
        token.cancelled().await;
        time::sleep(CLOSE_GRACE).await;
    };
    tokio::select! {
        biased;
        sent = ws_tx.send(message) => sent.is_ok(),
        () = grace_expired => false,
    }
}
