// Waitable primitives shared between the engine reader task and callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A result slot that is filled at most once and can be awaited by any
/// number of tasks.
///
/// Callers that start a new operation swap in a fresh `Arc<OneShot<_>>`
/// instead of resetting an existing one, so a waiter always observes the
/// outcome of the operation it awaited.
pub struct OneShot<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Store `value` unless the slot is already filled. Returns whether it was stored.
    pub fn set(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Wait up to `timeout` for the slot to be filled.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.slot.subscribe();
        let filled = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match filled {
            Ok(Ok(value)) => value.clone(),
            _ => None,
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct GateInner {
    open: watch::Sender<bool>,
    /// Bumped on every close so a delayed reopen scheduled earlier is dropped.
    epoch: AtomicU64,
}

/// Binary signal that is open while playback may proceed.
#[derive(Clone)]
pub struct PlayGate {
    inner: Arc<GateInner>,
}

impl PlayGate {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self {
            inner: Arc::new(GateInner {
                open: tx,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.inner.open.borrow()
    }

    pub fn open(&self) {
        self.inner.open.send_replace(true);
    }

    pub fn close(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.open.send_replace(false);
    }

    /// Open the gate once `delay` has elapsed, unless it is closed again first.
    pub fn open_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.open();
            return;
        }
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let gate = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if gate.inner.epoch.load(Ordering::Acquire) == epoch {
                gate.open();
            }
        });
    }

    /// Wait until the gate is open. Returns `false` if `timeout` expired first.
    pub async fn wait_open(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.inner.open.subscribe();
        let opened = rx.wait_for(|open| *open);
        match timeout {
            None => opened.await.is_ok(),
            Some(limit) => matches!(tokio::time::timeout(limit, opened).await, Ok(Ok(_))),
        }
    }
}
