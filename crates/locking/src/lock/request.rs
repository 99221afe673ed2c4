//! Queued lock requests and the waiting list
//!
//! Every blocked request parks on its own condition variable, always paired
//! with its resource's mutex. Releasers wake exactly the requests they
//! dequeue, so the queue scan decides who gets to re-check admission.

use super::LockMode;
use parking_lot::{Condvar, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tgraph_common::TransactionId;

#[derive(Debug, Default)]
struct Signal {
    /// Set once a releaser has dequeued the request
    dequeued: AtomicBool,
    condvar: Condvar,
}

/// A blocked acquisition, queued only while its thread is parked
#[derive(Debug)]
pub(crate) struct LockRequest {
    pub(crate) transaction: TransactionId,
    pub(crate) mode: LockMode,
    /// Requested write point (temporal write requests only)
    pub(crate) write_wait_time: Option<i64>,
    pub(crate) since: Instant,
    signal: Arc<Signal>,
}

impl LockRequest {
    /// Build a request plus the ticket its waiting thread keeps
    pub(crate) fn new(
        transaction: TransactionId,
        mode: LockMode,
        write_wait_time: Option<i64>,
    ) -> (Self, WaitTicket) {
        let signal = Arc::new(Signal::default());
        let request = Self {
            transaction,
            mode,
            write_wait_time,
            since: Instant::now(),
            signal: Arc::clone(&signal),
        };
        (request, WaitTicket { signal })
    }

    /// Hand the request back to its parked thread.
    ///
    /// Callers must have removed it from the waiting list already.
    pub(crate) fn wake(self) {
        self.signal.dequeued.store(true, Ordering::Release);
        self.signal.condvar.notify_one();
    }

    /// Wake the parked thread without dequeuing it
    fn nudge(&self) {
        self.signal.condvar.notify_one();
    }
}

/// Held by the parked thread to wait and to learn whether it was dequeued
#[derive(Debug)]
pub(crate) struct WaitTicket {
    signal: Arc<Signal>,
}

impl WaitTicket {
    pub(crate) fn was_woken(&self) -> bool {
        self.signal.dequeued.load(Ordering::Acquire)
    }

    /// Park on this request, releasing the resource mutex meanwhile
    pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.signal.condvar.wait(guard);
    }

    fn matches(&self, request: &LockRequest) -> bool {
        Arc::ptr_eq(&self.signal, &request.signal)
    }
}

/// Waiting list of a resource.
///
/// New requests go to the front and releasers examine the back, so the
/// longest-waiting request is considered first.
#[derive(Debug, Default)]
pub(crate) struct WaitingList {
    requests: VecDeque<LockRequest>,
}

impl WaitingList {
    pub(crate) fn push_front(&mut self, request: LockRequest) {
        self.requests.push_front(request);
    }

    pub(crate) fn back(&self) -> Option<&LockRequest> {
        self.requests.back()
    }

    pub(crate) fn pop_back(&mut self) -> Option<LockRequest> {
        self.requests.pop_back()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&LockRequest> {
        self.requests.get(index)
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Option<LockRequest> {
        self.requests.remove(index)
    }

    /// Drop the still-queued request belonging to `ticket`
    pub(crate) fn remove(&mut self, ticket: &WaitTicket) {
        if let Some(pos) = self.requests.iter().position(|r| ticket.matches(r)) {
            self.requests.remove(pos);
        }
    }

    /// Wake every parked request of `transaction` so it re-checks its state
    pub(crate) fn nudge_transaction(&self, transaction: TransactionId) -> usize {
        let mut nudged = 0;
        for request in self.requests.iter().filter(|r| r.transaction == transaction) {
            request.nudge();
            nudged += 1;
        }
        nudged
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LockRequest> {
        self.requests.iter()
    }

    /// How long the longest-waiting request has been queued
    pub(crate) fn max_wait_time(&self) -> Duration {
        self.requests
            .iter()
            .map(|r| r.since.elapsed())
            .max()
            .unwrap_or_default()
    }
}
