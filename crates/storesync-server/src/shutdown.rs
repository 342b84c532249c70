//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown of the server's background tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track a task to be awaited by [`graceful_shutdown`](Self::graceful_shutdown).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for every tracked task.
    ///
    /// Tasks still running after the timeout are aborted.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.shutdown();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        info!(
            task_count = handles.len(),
            timeout_ms = timeout.as_millis() as u64,
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
