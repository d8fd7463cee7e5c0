//! Graceful shutdown coordination via `CancellationToken`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Coordinates shutdown of the listener task and every live session.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// A coordinator with no sessions and an uncancelled token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run a session future so shutdown can wait for it.
    pub async fn track_session<F>(&self, session: F) -> F::Output
    where
        F: Future,
    {
        self.sessions.track_future(session).await
    }

    /// Number of sessions still running.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel the token, then wait up to `timeout` for `handles` and all
    /// tracked sessions. Returns `false` if the timeout elapsed first.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            task_count = handles.len(),
            sessions = self.live_sessions(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            self.sessions.wait().await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_propagates_to_tokens() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        assert!(!coord.is_shutting_down());

        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_tasks_and_sessions() {
        let coord = std::sync::Arc::new(ShutdownCoordinator::new());

        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        let session = {
            let coord = std::sync::Arc::clone(&coord);
            let token = coord.token();
            tokio::spawn(async move {
                coord
                    .track_session(async move {
                        token.cancelled().await;
                        7
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coord.live_sessions(), 1);

        assert!(coord.graceful_shutdown(vec![handle], Duration::from_secs(5)).await);
        assert_eq!(session.await.unwrap(), 7);
        assert_eq!(coord.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        let drained = coord
            .graceful_shutdown(vec![handle], Duration::from_millis(100))
            .await;
        assert!(!drained);
        assert!(coord.is_shutting_down());
    }
}
