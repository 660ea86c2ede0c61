//! One-shot cancellation and completion signals.
//!
//! # Responsibility
//! - Provide the fire-once primitive every node derives from its parent.
//! - Cascade cancellation from a signal to each signal derived from it.
//! - Expire deadline-bound signals through the shared deadline scheduler.
//!
//! # Invariants
//! - A signal fires at most once; the first cause wins.
//! - Listeners run exactly once and never under the internal lock.
//! - Releasing a signal never fires it.
//! - Cascades run on an explicit work stack; tree depth never grows the
//!   call stack.

use crate::timer::{self, Expire};
use log::info;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Reason a cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    /// Cancelled explicitly, on this signal or on an ancestor.
    Canceled,
    /// This signal's deadline (or an ancestor's) passed.
    DeadlineExceeded,
}

impl CancelCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl Display for CancelCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canceled => write!(f, "signal canceled"),
            Self::DeadlineExceeded => write!(f, "signal deadline exceeded"),
        }
    }
}

impl Error for CancelCause {}

type Listener<T> = Box<dyn FnOnce(T) + Send>;

struct LatchState<T> {
    value: Option<T>,
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    /// Latches that fire with this latch's value.
    dependents: Vec<(u64, Weak<Latch<T>>)>,
}

/// Fire-once cell with blocking waits and listener callbacks.
///
/// Firing propagates to dependent latches through an explicit work stack,
/// so cascade depth never grows the call stack.
struct Latch<T> {
    state: Mutex<LatchState<T>>,
    cond: Condvar,
}

impl<T: Clone + Send + 'static> Latch<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LatchState {
                value: None,
                next_id: 0,
                listeners: Vec::new(),
                dependents: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn value(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Fires this latch and every live dependent below it.
    ///
    /// Returns `false` when this latch had already fired.
    fn fire(&self, value: T) -> bool {
        let Some(mut pending) = self.settle(&value) else {
            return false;
        };
        while let Some(latch) = pending.pop() {
            if let Some(dependents) = latch.settle(&value) {
                pending.extend(dependents);
            }
        }
        true
    }

    /// Stores `value` and runs listeners; returns the dependents to fire
    /// next, or `None` when already fired.
    fn settle(&self, value: &T) -> Option<Vec<Arc<Latch<T>>>> {
        let (listeners, dependents) = {
            let mut state = self.lock();
            if state.value.is_some() {
                return None;
            }
            state.value = Some(value.clone());
            self.cond.notify_all();
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.dependents),
            )
        };
        for (_, listener) in listeners {
            listener(value.clone());
        }
        Some(
            dependents
                .into_iter()
                .filter_map(|(_, dependent)| dependent.upgrade())
                .collect(),
        )
    }

    fn subscribe(self: &Arc<Self>, listener: impl FnOnce(T) + Send + 'static) -> Subscription {
        let mut state = self.lock();
        if let Some(value) = state.value.clone() {
            drop(state);
            listener(value);
            return Subscription::inert();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Box::new(listener)));
        self.subscription(id)
    }

    /// Makes `dependent` fire whenever this latch fires.
    fn link(self: &Arc<Self>, dependent: &Arc<Latch<T>>) -> Subscription {
        let mut state = self.lock();
        if let Some(value) = state.value.clone() {
            drop(state);
            dependent.fire(value);
            return Subscription::inert();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.dependents.push((id, Arc::downgrade(dependent)));
        self.subscription(id)
    }

    fn subscription(self: &Arc<Self>, id: u64) -> Subscription {
        let source: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription {
            source: Some(source),
            id,
        }
    }

    fn wait(&self) -> T {
        let mut state = self.lock();
        loop {
            if let Some(value) = state.value.clone() {
                return value;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut state = self.lock();
        loop {
            if let Some(value) = state.value.clone() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

impl<T: Clone + Send + 'static> Unsubscribe for Latch<T> {
    fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.dependents.retain(|(dependent_id, _)| *dependent_id != id);
    }
}

/// Listener registration on a signal.
///
/// Dropping the subscription removes a listener that has not run yet.
#[must_use = "dropping a subscription removes its listener"]
pub struct Subscription {
    source: Option<Weak<dyn Unsubscribe>>,
    id: u64,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            source: None,
            id: 0,
        }
    }

    /// Keeps the listener registered for the lifetime of the signal.
    pub fn detach(mut self) {
        self.source = None;
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.source.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(source) = self.source.take().and_then(|weak| weak.upgrade()) {
            source.unsubscribe(self.id);
        }
    }
}

struct SignalInner {
    latch: Arc<Latch<CancelCause>>,
    deadline: Option<Instant>,
    released: AtomicBool,
    parent_link: Mutex<Option<Subscription>>,
}

/// Cancellable, optionally deadline-bound signal.
///
/// Signals derived with [`Signal::child`] or [`Signal::child_with_deadline`]
/// fire with the parent's cause as soon as the parent fires.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    /// Creates a root signal that fires only when cancelled.
    pub fn new() -> Self {
        Self::with_parts(None)
    }

    /// Creates a root signal that expires at `deadline`.
    ///
    /// # Errors
    /// - Returns an error when the deadline timer thread cannot be spawned.
    pub fn with_deadline(deadline: Instant) -> io::Result<Self> {
        let signal = Self::with_parts(Some(deadline));
        signal.arm_deadline()?;
        Ok(signal)
    }

    /// Creates a root signal that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> io::Result<Self> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Ok(Self::new()),
        }
    }

    /// Derives a signal that fires when this one fires.
    pub fn child(&self) -> Signal {
        let child = Self::with_parts(None);
        self.link_child(&child);
        child
    }

    /// Derives a signal that fires when this one fires or `deadline` passes.
    ///
    /// # Errors
    /// - Returns an error when the deadline timer thread cannot be spawned.
    pub fn child_with_deadline(&self, deadline: Instant) -> io::Result<Signal> {
        let child = Self::with_parts(Some(deadline));
        self.link_child(&child);
        child.arm_deadline()?;
        Ok(child)
    }

    /// Fires the signal with [`CancelCause::Canceled`].
    ///
    /// Returns `false` when the signal had already fired.
    pub fn cancel(&self) -> bool {
        self.inner.latch.fire(CancelCause::Canceled)
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.inner.latch.value()
    }

    pub fn is_fired(&self) -> bool {
        self.cause().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) -> CancelCause {
        self.inner.latch.wait()
    }

    /// Blocks until the signal fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelCause> {
        self.inner.latch.wait_timeout(timeout)
    }

    /// Registers `listener` to run once when the signal fires.
    ///
    /// Runs `listener` immediately on the calling thread when the signal has
    /// already fired. Otherwise it runs on whichever thread fires the signal,
    /// including the shared deadline thread, so it must not block.
    pub fn subscribe(&self, listener: impl FnOnce(CancelCause) + Send + 'static) -> Subscription {
        self.inner.latch.subscribe(listener)
    }

    /// Stops the deadline timer and unlinks this signal from its parent.
    pub(crate) fn release(&self) {
        self.inner.released.store(true, Ordering::Release);
        let link = self
            .inner
            .parent_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(link);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    fn with_parts(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                latch: Latch::new(),
                deadline,
                released: AtomicBool::new(false),
                parent_link: Mutex::new(None),
            }),
        }
    }

    fn link_child(&self, child: &Signal) {
        let link = self.inner.latch.link(&child.inner.latch);
        *child
            .inner
            .parent_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    fn arm_deadline(&self) -> io::Result<()> {
        let Some(deadline) = self.inner.deadline else {
            return Ok(());
        };
        if deadline <= Instant::now() {
            expire(&self.inner);
            return Ok(());
        }
        let target: Weak<dyn Expire> = Arc::downgrade(&self.inner) as Weak<dyn Expire>;
        timer::schedule(deadline, target)
    }
}

impl Expire for SignalInner {
    fn expire(&self) {
        if !self.released.load(Ordering::Acquire) {
            expire(self);
        }
    }
}

fn expire(inner: &SignalInner) {
    if inner.latch.fire(CancelCause::DeadlineExceeded) {
        info!("event=deadline_expired module=signal status=ok");
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("deadline", &self.inner.deadline)
            .field("cause", &self.cause())
            .finish()
    }
}

/// Completion signal of a node; fires once when the node leaves `active`.
#[derive(Clone)]
pub struct Completion {
    latch: Arc<Latch<()>>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            latch: Latch::new(),
        }
    }

    pub(crate) fn fire(&self) -> bool {
        self.latch.fire(())
    }

    pub fn is_fired(&self) -> bool {
        self.latch.value().is_some()
    }

    /// Blocks until the node finishes.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Blocks until the node finishes or `timeout` elapses.
    ///
    /// Returns `true` when the node finished in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout).is_some()
    }

    /// Registers `listener` to run once when the node finishes.
    pub fn subscribe(&self, listener: impl FnOnce() + Send + 'static) -> Subscription {
        self.latch.subscribe(move |()| listener())
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("fired", &self.is_fired())
            .finish()
    }
}
