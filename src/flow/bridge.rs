//! Demand bridge: converts push-style readiness into a pull-style stream.
//!
//! # Responsibilities
//! - Track outstanding consumer demand (bounded counter or unbounded)
//! - Allow exactly one attached consumer at a time
//! - Let the producer side wait (reads paused) while demand is zero
//! - Deliver exactly one terminal signal (complete or error)
//!
//! # Design Decisions
//! - Demand is counted per emitted chunk, not per byte
//! - `u64::MAX` is the unbounded sentinel; requests saturate into it
//! - The producer is the only owner of the sending half, so dropping it
//!   is the single completion path

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use crate::error::{NetError, Result};

/// Unbounded demand sentinel.
pub const UNBOUNDED: u64 = u64::MAX;

/// Demand window applied when a consumer attaches in windowed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prefetch(u64);

impl Prefetch {
    /// No flow control: the producer reads as fast as the socket allows.
    pub const UNBOUNDED: Prefetch = Prefetch(UNBOUNDED);

    /// A bounded window. Zero is clamped to one.
    pub fn bounded(n: u64) -> Self {
        Self(n.max(1))
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_unbounded(&self) -> bool {
        self.0 == UNBOUNDED
    }

    /// Number of delivered items after which the window is topped up again.
    pub fn replenish_limit(&self) -> u64 {
        (self.0 - (self.0 >> 2)).max(1)
    }
}

impl Default for Prefetch {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// How an attached consumer drives demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// Request the window up front and replenish automatically while polling.
    Window(Prefetch),
    /// Demand only grows through explicit [`Inbound::request`] calls.
    Manual,
}

/// Producer readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Demand is outstanding; the producer may read and emit.
    Demand,
    /// The stream terminated or will never get a consumer again.
    Closed,
}

/// State shared by both halves of a bridge.
#[derive(Debug, Default)]
pub struct BridgeState {
    demand: AtomicU64,
    attached: AtomicBool,
    terminated: AtomicBool,
    abandoned: AtomicBool,
    notify: Notify,
}

impl BridgeState {
    fn add_demand(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    None
                } else {
                    Some(current.saturating_add(n))
                }
            });
        self.notify.notify_one();
    }

    fn take_one(&self) -> bool {
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.demand.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Outstanding demand (`UNBOUNDED` when flow control is off).
    pub fn outstanding(&self) -> u64 {
        self.demand.load(Ordering::Acquire)
    }

    /// True while a consumer is attached.
    pub fn has_consumer(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Reads are paused whenever no demand is outstanding.
    pub fn reads_paused(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.is_terminated() || self.abandoned.load(Ordering::Acquire)
    }

    async fn wait_until(&self, ready: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(self) {
                return;
            }
            notified.await;
        }
    }
}

type Slot<T> = Arc<Mutex<Option<mpsc::UnboundedReceiver<Result<T>>>>>;

/// Consumer-facing handle of a bridge, owned by the connection.
pub struct DemandBridge<T> {
    state: Arc<BridgeState>,
    slot: Slot<T>,
}

impl<T> Clone for DemandBridge<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for DemandBridge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemandBridge")
            .field("demand", &self.state.outstanding())
            .field("attached", &self.state.has_consumer())
            .field("terminated", &self.state.is_terminated())
            .finish()
    }
}

/// Create a bridge and its producer half.
pub fn channel<T>() -> (DemandBridge<T>, BridgeProducer<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(BridgeState::default());
    let bridge = DemandBridge {
        state: Arc::clone(&state),
        slot: Arc::new(Mutex::new(Some(rx))),
    };
    (bridge, BridgeProducer { tx, state })
}

impl<T> DemandBridge<T> {
    /// Attach the single consumer.
    ///
    /// Fails with `AlreadySubscribed` while another consumer is attached;
    /// that consumer is left untouched.
    pub fn attach(&self, demand: Demand) -> Result<Inbound<T>> {
        if self
            .state
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::AlreadySubscribed);
        }

        let rx = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                // Terminated and drained earlier: attach to an empty stream.
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            });

        Ok(Inbound {
            rx: Some(rx),
            state: Arc::clone(&self.state),
            slot: Arc::clone(&self.slot),
            demand,
            primed: false,
            delivered: 0,
            done: false,
        })
    }

    /// Mark that no consumer will ever attach again. The producer observes
    /// `Readiness::Closed` and stops reading.
    pub fn abandon(&self) {
        self.state.abandoned.store(true, Ordering::Release);
        self.state.notify.notify_one();
    }

    pub fn is_attached(&self) -> bool {
        self.state.has_consumer()
    }

    pub fn outstanding(&self) -> u64 {
        self.state.outstanding()
    }

    pub fn reads_paused(&self) -> bool {
        self.state.reads_paused()
    }

    pub(crate) fn state(&self) -> Arc<BridgeState> {
        Arc::clone(&self.state)
    }
}

/// Attached consumer. Yields items up to the demand it granted.
pub struct Inbound<T> {
    rx: Option<mpsc::UnboundedReceiver<Result<T>>>,
    state: Arc<BridgeState>,
    slot: Slot<T>,
    demand: Demand,
    primed: bool,
    delivered: u64,
    done: bool,
}

impl<T> fmt::Debug for Inbound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("demand", &self.demand)
            .field("outstanding", &self.state.outstanding())
            .field("done", &self.done)
            .finish()
    }
}

impl<T> Inbound<T> {
    /// Grant `n` more emissions. Saturates into unbounded.
    pub fn request(&self, n: u64) {
        if !self.done {
            self.state.add_demand(n);
        }
    }

    /// Detach and pause reads. The connection stays open.
    pub fn cancel(self) {}

    /// True once the terminal signal was observed.
    pub fn is_terminated(&self) -> bool {
        self.done
    }

    /// Demand granted but not yet used by the producer.
    pub fn outstanding(&self) -> u64 {
        self.state.outstanding()
    }

    fn prime(&mut self) {
        if self.primed {
            return;
        }
        self.primed = true;
        if let Demand::Window(prefetch) = self.demand {
            self.state.add_demand(prefetch.get());
        }
    }

    fn on_delivered(&mut self) {
        if let Demand::Window(prefetch) = self.demand {
            if prefetch.is_unbounded() {
                return;
            }
            self.delivered += 1;
            let limit = prefetch.replenish_limit();
            if self.delivered >= limit {
                self.delivered = 0;
                self.state.add_demand(limit);
            }
        }
    }
}

impl<T> Stream for Inbound<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.prime();

        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(item))) => {
                this.on_delivered();
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Inbound<T> {
    fn drop(&mut self) {
        self.state.demand.store(0, Ordering::Release);
        if let Some(rx) = self.rx.take() {
            if !self.done {
                *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
            }
        }
        self.state.attached.store(false, Ordering::Release);
        self.state.notify.notify_one();
    }
}

/// Producer half, driven by the I/O task that owns the socket.
pub struct BridgeProducer<T> {
    tx: mpsc::UnboundedSender<Result<T>>,
    state: Arc<BridgeState>,
}

impl<T> fmt::Debug for BridgeProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeProducer")
            .field("demand", &self.state.outstanding())
            .finish()
    }
}

impl<T> BridgeProducer<T> {
    /// Wait until demand is outstanding or the bridge closed.
    pub async fn ready(&self) -> Readiness {
        self.state
            .wait_until(|s| s.is_closed() || s.outstanding() > 0)
            .await;
        if self.state.is_closed() {
            Readiness::Closed
        } else {
            Readiness::Demand
        }
    }

    /// Resolves once the bridge is abandoned or terminated.
    pub async fn closed(&self) {
        self.state.wait_until(BridgeState::is_closed).await;
    }

    pub fn has_demand(&self) -> bool {
        self.state.outstanding() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn has_consumer(&self) -> bool {
        self.state.has_consumer()
    }

    /// Deliver one item, consuming one unit of demand.
    pub fn emit(&self, item: T) -> Result<()> {
        if self.state.is_terminated() {
            return Err(NetError::NotRunning("stream already terminated"));
        }
        if !self.state.take_one() {
            return Err(NetError::NoDemand);
        }
        self.tx
            .send(Ok(item))
            .map_err(|_| NetError::NotRunning("bridge dropped"))
    }

    /// Deliver one item if demand is outstanding, handing it back otherwise.
    pub fn try_emit(&self, item: T) -> std::result::Result<(), T> {
        if !self.state.take_one() {
            return Err(item);
        }
        // A send only fails once the consumer side saw its terminal signal.
        let _ = self.tx.send(Ok(item));
        Ok(())
    }

    /// Deliver one item, waiting for demand.
    ///
    /// Demand lost to a cancelled consumer keeps the item here until the
    /// next consumer requests more. Fails only when the bridge closed.
    pub async fn deliver(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            if self.ready().await == Readiness::Closed {
                return Err(NetError::NotRunning("bridge closed"));
            }
            match self.try_emit(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
        }
    }

    /// Terminal success signal.
    pub fn complete(self) {}

    /// Terminal error signal.
    pub fn error(self, err: NetError) {
        let _ = self.tx.send(Err(err));
    }
}

impl<T> Drop for BridgeProducer<T> {
    fn drop(&mut self) {
        self.state.terminated.store(true, Ordering::Release);
        self.state.notify.notify_one();
    }
}
