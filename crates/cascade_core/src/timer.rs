//! Shared deadline scheduler.
//!
//! # Responsibility
//! - Expire deadline-bound targets from one lazily started background thread.
//!
//! # Invariants
//! - At most one scheduler thread runs per process.
//! - Entries hold weak references; a target dropped before its deadline is
//!   skipped.
//! - Expiry callbacks run without the scheduler lock held.

use log::info;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Instant;

const SCHEDULER_THREAD_NAME: &str = "cascade-deadline";

static SCHEDULER: Lazy<DeadlineScheduler> = Lazy::new(DeadlineScheduler::new);

/// Something that can be expired by the scheduler.
pub(crate) trait Expire: Send + Sync {
    fn expire(&self);
}

struct TimerEntry {
    deadline: Instant,
    /// Insertion order; breaks deadline ties first-in first-out.
    generation: u64,
    target: Weak<dyn Expire>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
    running: bool,
}

impl SchedulerState {
    fn pop_expired(&mut self, now: Instant) -> Vec<Weak<dyn Expire>> {
        let mut expired = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                expired.push(entry.target);
            }
        }
        expired
    }
}

struct DeadlineScheduler {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    threads_started: AtomicUsize,
}

/// Schedules `target` to expire at `deadline`.
///
/// # Errors
/// - Returns an error when the scheduler thread cannot be spawned.
pub(crate) fn schedule(deadline: Instant, target: Weak<dyn Expire>) -> io::Result<()> {
    let scheduler: &'static DeadlineScheduler = &SCHEDULER;
    scheduler.schedule(deadline, target)
}

/// Number of scheduler threads started in this process.
#[cfg(test)]
pub(crate) fn threads_started() -> usize {
    SCHEDULER.threads_started.load(AtomicOrdering::Acquire)
}

impl DeadlineScheduler {
    fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
            threads_started: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&'static self, deadline: Instant, target: Weak<dyn Expire>) -> io::Result<()> {
        let mut state = self.lock();
        let earliest = state
            .heap
            .peek()
            .map_or(true, |entry| deadline < entry.deadline);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.heap.push(TimerEntry {
            deadline,
            generation,
            target,
        });

        if !state.running {
            thread::Builder::new()
                .name(SCHEDULER_THREAD_NAME.to_string())
                .spawn(move || self.run())?;
            state.running = true;
            self.threads_started.fetch_add(1, AtomicOrdering::AcqRel);
            info!("event=deadline_scheduler_start module=timer status=ok");
        } else if earliest {
            self.wake.notify_one();
        }
        Ok(())
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            let expired = state.pop_expired(now);
            if !expired.is_empty() {
                drop(state);
                for target in expired {
                    if let Some(target) = target.upgrade() {
                        target.expire();
                    }
                }
                state = self.lock();
                continue;
            }

            state = match state.heap.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    self.wake
                        .wait_timeout(state, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}
