//! Shutdown coordination between a server and its connection tasks.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Running,
    /// Stop accepting; let in-flight work finish.
    Draining,
    /// Drain deadline passed; abort whatever is left.
    Forced,
}

/// Coordinator for graceful shutdown.
///
/// A watch channel that every long-running task of a server subscribes to.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<Signal>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Signal::Running);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Stop accepting new work.
    pub fn drain(&self) {
        self.tx.send_if_modified(|s| {
            if *s == Signal::Running {
                *s = Signal::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Abort remaining connections.
    pub fn force(&self) {
        self.tx.send_replace(Signal::Forced);
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-side view of the shutdown signal.
///
/// A dropped coordinator counts as forced.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<Signal>,
}

impl ShutdownListener {
    /// Resolves once draining (or forced) shutdown began.
    pub async fn draining(&mut self) {
        let _ = self.rx.wait_for(|s| *s != Signal::Running).await;
    }

    /// Resolves once shutdown was forced.
    pub async fn forced(&mut self) {
        let _ = self.rx.wait_for(|s| *s == Signal::Forced).await;
    }

    pub fn is_draining(&self) -> bool {
        *self.rx.borrow() != Signal::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn drain_then_force() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        assert!(!listener.is_draining());
        assert!(listener.draining().now_or_never().is_none());

        shutdown.drain();
        listener.draining().await;
        assert!(listener.forced().now_or_never().is_none());

        shutdown.force();
        listener.forced().await;
    }

    #[tokio::test]
    async fn dropped_coordinator_releases_listeners() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        drop(shutdown);
        listener.forced().await;
    }
}
