//! Cooperative sleep/wake primitive shared by every worker.
//!
//! The daemon's single termination signal: a latch that flips exactly once,
//! observed by all current and future sleepers.  Workers never poll a flag in
//! a tight loop — they park in [`Shutdown::sleep`] and are released the
//! moment the latch flips.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of a [`Shutdown::sleep`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sleep {
    /// The full duration elapsed; the daemon keeps running.
    Timeout,
    /// The daemon is shutting down; stop working and return.
    Woken,
}

/// Handle on the process-wide termination signal.
///
/// Cheap to clone; every clone observes the same latch.  The latch only ever
/// transitions from running to terminating, and once flipped it stays
/// flipped — a sleeper arriving late is woken immediately.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a fresh, untriggered handle.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flip the latch.  Idempotent; wakes every sleeper.
    pub fn trigger(&self) {
        // send_if_modified keeps the transition one-shot.
        self.tx.send_if_modified(|v| {
            let flip = !*v;
            *v = true;
            flip
        });
    }

    /// Whether the daemon is still running.
    pub fn is_running(&self) -> bool {
        !*self.rx.borrow()
    }

    /// Sleep for at least `duration`, or until the daemon begins
    /// terminating, whichever comes first.
    pub async fn sleep(&self, duration: Duration) -> Sleep {
        tokio::select! {
            biased;
            _ = self.woken() => Sleep::Woken,
            _ = tokio::time::sleep(duration) => Sleep::Timeout,
        }
    }

    /// Resolve once the daemon begins terminating.
    pub async fn woken(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            // The sender lives as long as any handle, so this cannot fail.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}
