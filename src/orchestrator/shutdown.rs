//! Interrupt propagation and the exactly-once finalization guard.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Sending half. Dropping it does not trigger shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into everything that awaits the agent.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Trigger on Ctrl-C (and SIGTERM on unix) from a background task.
    pub fn listen_for_signals(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::warn!("interrupt received, shutting down after the current step");
            self.trigger();
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

impl Shutdown {
    /// A receiver that never fires.
    pub fn never() -> Self {
        let (_trigger, shutdown) = channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        // A closed channel without a trigger never resolves.
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs a closure at most once across every caller.
#[derive(Debug, Default)]
pub struct ExactlyOnce {
    done: AtomicBool,
}

impl ExactlyOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some` with the closure's value on the first call, `None` afterwards.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.done.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(f())
        }
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, shutdown) = channel();
        let mut waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        assert!(!shutdown.is_triggered());
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut shutdown = Shutdown::never();
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown.wait()).await;
        assert!(waited.is_err());
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn test_exactly_once() {
        let once = ExactlyOnce::new();
        assert_eq!(once.run(|| 1), Some(1));
        assert_eq!(once.run(|| 2), None);
        assert!(once.has_run());
    }
}
