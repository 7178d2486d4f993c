//! Shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for in-flight work when none is configured.
const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Owns the process-wide cancellation token.
///
/// Cancelling it stops the HTTP listener and unblocks every correlation wait
/// that was handed a clone.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                token.cancel();
            }
        });
    }

    /// Cancel the token, then wait up to `grace` for `handles` to finish.
    /// Tasks still running after the grace period are aborted.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, grace: Option<Duration>) {
        let grace = grace.unwrap_or(DEFAULT_GRACE);
        self.shutdown();
        info!(
            task_count = handles.len(),
            grace_ms = grace.as_millis() as u64,
            "draining tasks"
        );

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let all = futures::future::join_all(handles);

        if tokio::time::timeout(grace, all).await.is_err() {
            warn!("drain timed out after {grace:?}; aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
