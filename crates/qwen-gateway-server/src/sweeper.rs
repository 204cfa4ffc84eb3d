use std::time::Duration;

use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use qwen_gateway_core::current_unix_timestamp_ms;
use qwen_gateway_store::GatewayStore;

use crate::metrics::SESSIONS_SWEPT_TOTAL;

/// Handle over the background expiration sweeper. Dropping it without
/// calling [`SessionSweeperHandle::shutdown`] detaches the task.
pub struct SessionSweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionSweeperHandle {
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Starts the periodic sweep that deletes sessions whose access window has
/// lapsed (audit rows cascade with them).
pub fn start_session_sweeper(store: GatewayStore, interval: Duration) -> SessionSweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of `interval` fires immediately; consume it so the
        // sweep cadence starts one full period out.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.sweep_expired_sessions(current_unix_timestamp_ms()) {
                        Ok(0) => tracing::debug!("session sweep removed nothing"),
                        Ok(removed) => {
                            counter!(SESSIONS_SWEPT_TOTAL).increment(removed as u64);
                            tracing::info!(removed, "session sweep removed expired sessions");
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "session sweep failed");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("session sweeper stopping");
                    break;
                }
            }
        }
    });
    SessionSweeperHandle {
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(timeout_ms: u64) -> (tempfile::TempDir, GatewayStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            GatewayStore::open(&dir.path().join("gateway.db"), timeout_ms).expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn sweeper_removes_expired_rows_and_stops_cleanly() {
        let (_dir, store) = open_store(1);
        let id = qwen_gateway_store::conversation_fingerprint("hi");
        store
            .insert_session(&id, "chat-001", "hi", 0)
            .expect("insert");

        let mut handle = start_session_sweeper(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.shutdown().await;

        assert_eq!(store.count_sessions().expect("count"), 0);
    }

    #[tokio::test]
    async fn shutdown_before_first_tick_is_clean() {
        let (_dir, store) = open_store(60_000);
        let mut handle = start_session_sweeper(store, Duration::from_secs(600));
        handle.shutdown().await;
    }
}
