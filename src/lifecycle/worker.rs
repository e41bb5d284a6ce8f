use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

const DISCONNECT_POLL: Duration = Duration::from_millis(250);

/// Registry key assigned by [`super::LifecycleManager::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Handle to an externally spawned rendering subprocess.
///
/// The governor never creates processes itself; it only manages handles it is given.
#[async_trait]
pub trait Worker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// OS process id, when the handle exposes one.
    fn process_id(&self) -> Option<u32>;

    /// Graceful shutdown. Callers bound this with their own timeout.
    async fn close(&self) -> Result<()>;

    /// Resolves once the worker is no longer connected.
    async fn disconnected(&self) {
        while self.is_connected() {
            tokio::time::sleep(DISCONNECT_POLL).await;
        }
    }
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self) -> Result<Arc<dyn Worker>>;
}


#[cfg(test)]
mod tests {
    use super::testing::FakeWorker;
    use super::*;

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId(7).to_string(), "worker-7");
    }

    #[tokio::test(start_paused = true)]
    async fn default_disconnected_polls_until_disconnected() {
        struct Polled(std::sync::atomic::AtomicBool);

        #[async_trait]
        impl Worker for Polled {
            fn is_connected(&self) -> bool {
                self.0.load(std::sync::atomic::Ordering::SeqCst)
            }
            fn process_id(&self) -> Option<u32> {
                None
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let worker = Arc::new(Polled(std::sync::atomic::AtomicBool::new(true)));
        let waiter = tokio::spawn({
            let worker = worker.clone();
            async move { worker.disconnected().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        worker.0.store(false, std::sync::atomic::Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn fake_worker_close_disconnects() {
        let worker = FakeWorker::new(Some(1));
        worker.close().await.unwrap();
        assert!(!worker.is_connected());
        worker.disconnected().await;
    }
}
