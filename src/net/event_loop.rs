//! Event-loop group: a fixed set of single-threaded runtimes.
//!
//! # Responsibilities
//! - Own N OS threads, each driving a current-thread Tokio runtime
//! - Hand out loops round-robin for new connections
//! - Stop every loop on shutdown and wait for the threads to exit
//!
//! # Design Decisions
//! - A connection's I/O stays on the loop it was assigned to
//! - Groups can be shared between servers; only the creator shuts them down

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Number of loops used when none is configured.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct EventLoop {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    exited: Mutex<Option<oneshot::Receiver<()>>>,
}

/// A group of event loops shared by one or more servers.
pub struct EventLoopGroup {
    name: String,
    loops: Vec<EventLoop>,
    /// Round-robin cursor.
    current: AtomicUsize,
    shut_down: AtomicBool,
}

impl EventLoopGroup {
    /// Spawn `threads` loops (at least one) named `{name}-{index}`.
    pub fn new(name: impl Into<String>, threads: usize) -> io::Result<Arc<Self>> {
        let name = name.into();
        let threads = threads.max(1);
        let mut loops = Vec::with_capacity(threads);

        for index in 0..threads {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let handle = runtime.handle().clone();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let (exited_tx, exited_rx) = oneshot::channel::<()>();

            std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    runtime.block_on(async {
                        let _ = stop_rx.await;
                    });
                    drop(runtime);
                    let _ = exited_tx.send(());
                })?;

            loops.push(EventLoop {
                handle,
                stop: Mutex::new(Some(stop_tx)),
                exited: Mutex::new(Some(exited_rx)),
            });
        }

        tracing::debug!(group = %name, threads, "Event loop group started");

        Ok(Arc::new(Self {
            name,
            loops,
            current: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Next loop in round-robin order.
    pub fn next(&self) -> LoopHandle {
        let index = self.current.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.handle_at(index)
    }

    /// Loop at a fixed index, if it exists.
    pub fn get(&self, index: usize) -> Option<LoopHandle> {
        (index < self.loops.len()).then(|| self.handle_at(index))
    }

    fn handle_at(&self, index: usize) -> LoopHandle {
        LoopHandle {
            index,
            handle: self.loops[index].handle.clone(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop every loop and wait for its thread to exit. Idempotent.
    ///
    /// Must not be awaited from a task running on this group.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal_stop();
        let exits: Vec<_> = self
            .loops
            .iter()
            .filter_map(|lp| lp.exited.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect();
        for exited in exits {
            let _ = exited.await;
        }
        tracing::debug!(group = %self.name, "Event loop group stopped");
    }

    /// Ask every loop to stop without waiting for the threads.
    pub(crate) fn signal_stop(&self) {
        self.shut_down.store(true, Ordering::Release);
        for lp in &self.loops {
            if let Some(stop) = lp.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = stop.send(());
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("name", &self.name)
            .field("loops", &self.loops.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Handle onto one loop of a group.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    index: usize,
    handle: Handle,
}

impl LoopHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run a task on this loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_loops() {
        let group = EventLoopGroup::new("test-rr", 3).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| group.next().index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert!(group.get(3).is_none());
    }

    #[tokio::test]
    async fn tasks_run_on_named_threads() {
        let group = EventLoopGroup::new("test-loop", 2).unwrap();
        let name = group
            .next()
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-loop-0"));

        group.shutdown().await;
        group.shutdown().await;
        assert!(group.is_shut_down());
    }

    #[test]
    fn zero_threads_still_yields_one_loop() {
        let group = EventLoopGroup::new("test-min", 0).unwrap();
        assert_eq!(group.len(), 1);
    }
}
