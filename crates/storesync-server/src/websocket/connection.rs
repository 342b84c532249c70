//! Per-client connection state and its outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use storesync_core::{ConnectionId, SendError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized envelope, sent as a text frame.
    Text(Arc<str>),
    /// Liveness probe: a transport Ping followed by the serialized `ping` envelope.
    Probe(Arc<str>),
    /// Close the socket with this code and reason.
    Close(CloseReason),
}

/// Close code and reason sent when the server ends a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl CloseReason {
    /// The client did not answer a probe before the next sweep.
    pub const LIVENESS_TIMEOUT: Self = Self {
        code: 1000,
        reason: "liveness timeout",
    };
    /// A frame could not be queued for the client.
    pub const SEND_FAILURE: Self = Self {
        code: 1000,
        reason: "send failure",
    };
    /// The server is shutting down.
    pub const GOING_AWAY: Self = Self {
        code: 1001,
        reason: "server shutting down",
    };

    /// Short label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self.reason {
            "liveness timeout" => "liveness",
            "send failure" => "send_failure",
            _ => "shutdown",
        }
    }
}

/// A registered client.
///
/// The registry holds the only long-lived reference; the socket task holds
/// another for the lifetime of the socket.
pub struct ClientConnection {
    id: ConnectionId,
    /// Store the client subscribed to; `None` is the wildcard.
    scope: Mutex<Option<String>>,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    close_token: CancellationToken,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection in the live, wildcard-scoped state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            scope: Mutex::new(None),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current scope (`None` = all stores).
    pub fn scope(&self) -> Option<String> {
        self.scope.lock().clone()
    }

    /// Replace the scope.
    pub fn set_scope(&self, scope: Option<String>) {
        *self.scope.lock() = scope;
    }

    /// Whether an event for `store_id` should reach this client.
    pub fn wants_store(&self, store_id: &str) -> bool {
        self.scope
            .lock()
            .as_deref()
            .is_none_or(|scope| scope == store_id)
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Outbound) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }
        })
    }

    /// Queue a serialized envelope.
    pub fn send_text(&self, json: Arc<str>) -> Result<(), SendError> {
        self.send(Outbound::Text(json))
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the client answered since the last probe.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    /// Record a liveness reply.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Clear the liveness flag ahead of sending a probe. `last_seen` is untouched.
    pub fn mark_probed_pending(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
    }

    /// Time since the last liveness reply (or since connecting).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Server-initiated close: queue a Close frame and stop the writer.
    ///
    /// Returns `true` only for the call that actually closed the connection.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.try_send(Outbound::Close(reason));
        self.close_token.cancel();
        true
    }

    /// The socket went away on its own; stop the writer without a Close frame.
    ///
    /// Returns `true` if the connection was still open.
    pub fn detach(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_token.cancel();
        true
    }

    /// Whether [`close`](Self::close) or [`detach`](Self::detach) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.close_token.clone()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("scope", &self.scope())
            .field("alive", &self.is_alive())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(ConnectionId::from_raw("client_1"), tx);
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id().as_str(), "client_1");
        assert!(conn.scope().is_none());
        assert!(conn.is_alive());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn send_text_success() {
        let (conn, mut rx) = make_connection();
        conn.send_text(Arc::from("hello")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Outbound::Text(Arc::from("hello")));
    }

    #[test]
    fn send_to_closed_channel_fails() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert_eq!(conn.send_text(Arc::from("x")), Err(SendError::Closed));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_to_full_channel_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(ConnectionId::new(), tx);
        conn.send_text(Arc::from("msg1")).unwrap();
        assert_eq!(conn.send_text(Arc::from("msg2")), Err(SendError::Full));
    }

    #[test]
    fn wildcard_scope_wants_every_store() {
        let (conn, _rx) = make_connection();
        assert!(conn.wants_store("store-1"));
        assert!(conn.wants_store("store-2"));
    }

    #[test]
    fn scoped_connection_wants_only_its_store() {
        let (conn, _rx) = make_connection();
        conn.set_scope(Some("store-1".into()));
        assert!(conn.wants_store("store-1"));
        assert!(!conn.wants_store("store-2"));
        conn.set_scope(None);
        assert!(conn.wants_store("store-2"));
    }

    #[test]
    fn probe_pending_keeps_last_seen() {
        let (conn, _rx) = make_connection();
        std::thread::sleep(Duration::from_millis(5));
        conn.mark_probed_pending();
        assert!(!conn.is_alive());
        let before = conn.last_seen_elapsed();
        assert!(before >= Duration::from_millis(5));
        conn.mark_alive();
        assert!(conn.is_alive());
        assert!(conn.last_seen_elapsed() < before);
    }

    #[tokio::test]
    async fn close_queues_frame_once() {
        let (conn, mut rx) = make_connection();
        assert!(conn.close(CloseReason::LIVENESS_TIMEOUT));
        assert!(!conn.close(CloseReason::LIVENESS_TIMEOUT));
        assert!(!conn.detach());
        assert!(conn.is_closed());
        assert!(conn.closed_token().is_cancelled());
        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Close(CloseReason::LIVENESS_TIMEOUT)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_fails() {
        let (conn, _rx) = make_connection();
        let _ = conn.close(CloseReason::GOING_AWAY);
        assert_eq!(conn.send_text(Arc::from("late")), Err(SendError::Closed));
    }

    #[test]
    fn detach_sends_no_frame() {
        let (conn, mut rx) = make_connection();
        assert!(conn.detach());
        assert!(conn.closed_token().is_cancelled());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::LIVENESS_TIMEOUT.label(), "liveness");
        assert_eq!(CloseReason::SEND_FAILURE.label(), "send_failure");
        assert_eq!(CloseReason::GOING_AWAY.label(), "shutdown");
    }
}
