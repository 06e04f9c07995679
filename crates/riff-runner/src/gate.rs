//! One-shot readiness gate
//!
//! Armed when a runner is created and released exactly once when model
//! loading ends, successfully or not. Waiters that arrive after the release
//! pass straight through, so no wake-up can be missed.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared view of the gate
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

/// Releases the gate when dropped, or explicitly via [`release`](Self::release)
#[derive(Debug)]
pub struct GateRelease {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessGate {
    /// A closed gate and the handle that opens it
    pub fn armed() -> (Self, GateRelease) {
        let (tx, _rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (Self { tx: Arc::clone(&tx) }, GateRelease { tx })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the gate has been released
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on release.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl GateRelease {
    pub fn release(self) {
        // Drop opens the gate.
    }
}

impl Drop for GateRelease {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_released() {
        let (gate, release) = ReadinessGate::armed();
        assert!(!gate.is_open());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.release();

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter woke")
                .expect("join");
        }
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_late_waiter_passes() {
        let (gate, release) = ReadinessGate::armed();
        drop(release);
        tokio::time::timeout(Duration::from_millis(100), gate.wait())
            .await
            .expect("no wait after release");
    }

    #[tokio::test]
    async fn test_release_on_panic() {
        let (gate, release) = ReadinessGate::armed();
        let result = tokio::task::spawn_blocking(move || {
            let _release = release;
            panic!("load blew up");
        })
        .await;
        assert!(result.is_err());
        assert!(gate.is_open());
    }
}
