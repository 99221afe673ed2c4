//! Interval lock for time-versioned properties
//!
//! A read holds a closed time range `[start, end]`. A write holds a single
//! time point `t`, the write threshold, and conceptually covers everything
//! from `t` onward:
//!
//! - a read is admitted unless another transaction holds a threshold `t`
//!   with `end >= t`
//! - a write at `t` is admitted unless another transaction holds a
//!   threshold, or another transaction's read range contains `t`
//! - a transaction holding the threshold is always admitted, for reads and
//!   for further writes
//!
//! Readers of any ranges never block each other, and writers at points no
//! other transaction reads never wait for readers.
//!
//! ## Wake-up order
//!
//! Blocked requests are pushed to the front of the waiting list and
//! releasers look at the back, so the oldest request is examined first.
//! After releasing a read, the scan walks from the back toward the front.
//! It dequeues readers while no threshold is held, skips writers that are
//! still blocked, and stops after the first writer that became admissible.
//! After releasing the write threshold, the scan dequeues everything up to
//! and including the first writer.
//!
//! Only dequeued requests are woken. A dequeued waiter that is still blocked
//! when it runs re-enqueues at the front. Termination wakes every queued
//! request of the terminated transaction.

use super::element::TemporalElement;
use super::request::{LockRequest, WaitTicket, WaitingList};
use super::{Acquisition, HolderSnapshot, LockMode, LockSnapshot};
use crate::config::LockConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tgraph_common::{ResourceKey, TimeInterval, TimeIntervalList, TransactionId};
use tracing::{error, trace, warn};

/// What a pending temporal acquisition asks for
#[derive(Debug, Clone, Copy)]
enum TemporalRequest {
    Read(TimeInterval),
    Write(i64),
}

impl TemporalRequest {
    fn mode(&self) -> LockMode {
        match self {
            TemporalRequest::Read(_) => LockMode::Read,
            TemporalRequest::Write(_) => LockMode::Write,
        }
    }

    fn write_wait_time(&self) -> Option<i64> {
        match self {
            TemporalRequest::Read(_) => None,
            TemporalRequest::Write(time) => Some(*time),
        }
    }
}

#[derive(Debug, Default)]
struct TemporalState {
    /// Threshold of the single transaction holding write access
    write_threshold: Option<i64>,
    /// Multiset union of every element's read ranges
    read_intervals: TimeIntervalList,
    waiting: WaitingList,
    elements: HashMap<TransactionId, TemporalElement>,
    /// Pending acquisitions routed through the lock manager
    marked: usize,
}

impl TemporalState {
    fn is_terminated(&self, transaction: TransactionId) -> bool {
        self.elements
            .get(&transaction)
            .is_some_and(|e| e.terminated)
    }

    fn holds_write(&self, transaction: TransactionId) -> bool {
        self.elements
            .get(&transaction)
            .is_some_and(|e| e.write_threshold.is_some())
    }

    fn admits(&self, transaction: TransactionId, request: &TemporalRequest) -> bool {
        match request {
            TemporalRequest::Read(interval) => self.admits_read(transaction, interval),
            TemporalRequest::Write(time) => self.admits_write(transaction, *time),
        }
    }

    fn admits_read(&self, transaction: TransactionId, interval: &TimeInterval) -> bool {
        self.holds_write(transaction)
            || self
                .write_threshold
                .is_none_or(|threshold| interval.end() < threshold)
    }

    fn admits_write(&self, transaction: TransactionId, time: i64) -> bool {
        self.holds_write(transaction) || self.write_is_free_for(transaction, time)
    }

    /// No threshold is held and no other transaction reads at `time`
    fn write_is_free_for(&self, transaction: TransactionId, time: i64) -> bool {
        if self.write_threshold.is_some() {
            return false;
        }
        let point = TimeInterval::point(time);
        match self.elements.get(&transaction) {
            Some(element) => !self
                .read_intervals
                .union_except(&element.read_intervals, &point),
            None => !self.read_intervals.overlaps(&point),
        }
    }

    fn writer_admissible(&self, request: &LockRequest) -> bool {
        request
            .write_wait_time
            .is_some_and(|time| self.write_is_free_for(request.transaction, time))
    }

    /// Record a granted request. Returns true if the transaction held nothing before.
    fn register(&mut self, transaction: TransactionId, request: &TemporalRequest) -> bool {
        let element = self.elements.entry(transaction).or_default();
        let first = element.is_free();
        match *request {
            TemporalRequest::Read(interval) => {
                element.read_intervals.insert(interval);
                self.read_intervals.insert(interval);
            }
            TemporalRequest::Write(time) => {
                // a holder asking again moves its threshold to the new point
                element.write_threshold = Some(time);
                self.write_threshold = Some(time);
            }
        }
        first
    }

    /// Dequeue waiters after a read range was released
    fn wake_after_read_release(&mut self) -> Vec<TransactionId> {
        let mut woken = Vec::new();
        let mut index = self.waiting.len();
        while index > 0 {
            index -= 1;
            let Some(request) = self.waiting.get(index) else {
                break;
            };
            let (wake, last) = match request.mode {
                LockMode::Read => (self.write_threshold.is_none(), false),
                LockMode::Write => {
                    let admissible = self.writer_admissible(request);
                    (admissible, admissible)
                }
            };
            // removal only shifts requests nearer the back, which were already visited
            if wake {
                if let Some(request) = self.waiting.remove_at(index) {
                    woken.push(request.transaction);
                    request.wake();
                }
            }
            if last {
                break;
            }
        }
        woken
    }

    /// Dequeue waiters after the write threshold was released
    fn wake_after_write_release(&mut self) -> Vec<TransactionId> {
        let mut woken = Vec::new();
        if self.write_threshold.is_some() {
            return woken;
        }
        while let Some(request) = self.waiting.pop_back() {
            let writer = request.mode == LockMode::Write;
            woken.push(request.transaction);
            request.wake();
            if writer {
                break;
            }
        }
        woken
    }

    fn holders(&self) -> Vec<HolderSnapshot> {
        let mut holders: Vec<_> = self
            .elements
            .iter()
            .filter(|(_, e)| !e.is_free())
            .map(|(tx, e)| HolderSnapshot::Temporal {
                transaction: *tx,
                read_intervals: e.read_intervals.clone(),
                write_threshold: e.write_threshold,
            })
            .collect();
        holders.sort_by_key(|h| match h {
            HolderSnapshot::Temporal { transaction, .. }
            | HolderSnapshot::Plain { transaction, .. } => *transaction,
        });
        holders
    }

    fn describe(&self, resource: &ResourceKey) -> String {
        let mut out = String::new();
        let threshold = self
            .write_threshold
            .map_or_else(|| "none".to_string(), |t| t.to_string());
        let _ = writeln!(
            out,
            "TemporalLock[{}] write threshold={} read intervals={}",
            resource, threshold, self.read_intervals
        );
        let _ = writeln!(out, "Waiting list:");
        for request in self.waiting.iter() {
            let _ = writeln!(
                out,
                "  [{} {:?} at {:?} waiting {:?}]",
                request.transaction,
                request.mode,
                request.write_wait_time,
                request.since.elapsed()
            );
        }
        let _ = writeln!(out, "Locking transactions:");
        for (tx, element) in &self.elements {
            let _ = writeln!(
                out,
                "  {} (reads {}, write {:?})",
                tx, element.read_intervals, element.write_threshold
            );
        }
        out
    }
}

/// Interval lock for one temporal property of one entity
pub struct TemporalLock {
    resource: ResourceKey,
    state: Mutex<TemporalState>,
    detector: Arc<dyn DeadlockDetector>,
    log_deadlocks: bool,
}

impl TemporalLock {
    pub fn new(
        resource: ResourceKey,
        detector: Arc<dyn DeadlockDetector>,
        config: &LockConfig,
    ) -> Self {
        Self {
            resource,
            state: Mutex::new(TemporalState::default()),
            detector,
            log_deadlocks: config.log_deadlocks,
        }
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    /// Block until `transaction` may read `interval`
    pub fn acquire_read(
        &self,
        transaction: TransactionId,
        interval: TimeInterval,
    ) -> Result<Acquisition> {
        self.acquire(transaction, TemporalRequest::Read(interval))
    }

    /// Block until `transaction` may write at `time`
    pub fn acquire_write(&self, transaction: TransactionId, time: i64) -> Result<Acquisition> {
        self.acquire(transaction, TemporalRequest::Write(time))
    }

    /// Acquire a read range only if that is possible without waiting
    pub fn try_acquire_read(&self, transaction: TransactionId, interval: TimeInterval) -> bool {
        self.try_acquire(transaction, TemporalRequest::Read(interval))
    }

    /// Acquire a write point only if that is possible without waiting
    pub fn try_acquire_write(&self, transaction: TransactionId, time: i64) -> bool {
        self.try_acquire(transaction, TemporalRequest::Write(time))
    }

    fn acquire(&self, transaction: TransactionId, request: TemporalRequest) -> Result<Acquisition> {
        let mut state = self.state.lock();
        state.elements.entry(transaction).or_default().requests += 1;

        let mut ticket: Option<WaitTicket> = None;
        let mut enqueue = true;
        let outcome = loop {
            if state.is_terminated(transaction) {
                break Ok(Acquisition::Terminated);
            }
            if state.admits(transaction, &request) {
                if state.register(transaction, &request) {
                    self.detector.lock_acquired(&self.resource, transaction);
                }
                break Ok(Acquisition::Granted);
            }
            if let Err(e) = self.detector.check_wait_on(&self.resource, transaction) {
                if self.log_deadlocks {
                    warn!(
                        "Deadlock on {} for {}:\n{}",
                        self.resource,
                        transaction,
                        state.describe(&self.resource)
                    );
                }
                break Err(LockError::from(e));
            }
            if enqueue {
                let (queued, waiting) =
                    LockRequest::new(transaction, request.mode(), request.write_wait_time());
                state.waiting.push_front(queued);
                ticket = Some(waiting);
            }

            trace!("{} waiting on {} for {:?}", transaction, self.resource, request);
            if let Some(ticket) = ticket.as_ref() {
                ticket.wait(&mut state);
            }

            // a releaser that dequeued us expects a fresh request if we block again
            enqueue = ticket.as_ref().is_some_and(WaitTicket::was_woken);
            self.detector.stop_wait_on(&self.resource, transaction);
        };

        if let Some(ticket) = ticket.as_ref().filter(|t| !t.was_woken()) {
            state.waiting.remove(ticket);
        }
        self.finish_request(&mut state, transaction, &outcome);
        outcome
    }

    fn try_acquire(&self, transaction: TransactionId, request: TemporalRequest) -> bool {
        let mut state = self.state.lock();
        if state.is_terminated(transaction) || !state.admits(transaction, &request) {
            return false;
        }
        if state.register(transaction, &request) {
            self.detector.lock_acquired(&self.resource, transaction);
        }
        true
    }

    /// Drop the in-flight marker and discard bookkeeping that was never used
    fn finish_request(
        &self,
        state: &mut TemporalState,
        transaction: TransactionId,
        outcome: &Result<Acquisition>,
    ) {
        let granted = matches!(outcome, Ok(Acquisition::Granted));
        let remove = match state.elements.get_mut(&transaction) {
            Some(element) => {
                element.requests -= 1;
                !granted && element.is_removable()
            }
            None => false,
        };
        if remove {
            state.elements.remove(&transaction);
        }
    }

    /// Release one read range previously acquired with exactly these bounds
    pub fn release_read(&self, transaction: TransactionId, interval: TimeInterval) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .elements
            .get_mut(&transaction)
            .is_some_and(|e| e.read_intervals.remove(&interval));
        if !removed {
            return Err(self.not_found(transaction));
        }
        state.read_intervals.remove(&interval);

        self.after_release(&mut state, transaction);
        let woken = state.wake_after_read_release();
        self.notify(woken);
        Ok(())
    }

    /// Release every read range `transaction` holds here
    pub fn release_all_reads(&self, transaction: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        let held = match state.elements.get_mut(&transaction) {
            Some(element) if !element.read_intervals.is_empty() => {
                std::mem::take(&mut element.read_intervals)
            }
            _ => return Err(self.not_found(transaction)),
        };
        state.read_intervals.remove_all(&held);

        self.after_release(&mut state, transaction);
        let woken = state.wake_after_read_release();
        self.notify(woken);
        Ok(())
    }

    /// Release the write threshold held by `transaction`
    pub fn release_write(&self, transaction: TransactionId, time: i64) -> Result<()> {
        trace!("{} releasing write at {} on {}", transaction, time, self.resource);
        self.release_all_writes(transaction)
    }

    /// Release the write threshold held by `transaction`, whatever its point
    pub fn release_all_writes(&self, transaction: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        let released = state
            .elements
            .get_mut(&transaction)
            .and_then(|e| e.write_threshold.take());
        if released.is_none() {
            return Err(self.not_found(transaction));
        }
        state.write_threshold = None;

        self.after_release(&mut state, transaction);
        let woken = state.wake_after_write_release();
        self.notify(woken);
        Ok(())
    }

    fn after_release(&self, state: &mut TemporalState, transaction: TransactionId) {
        let (free, removable) = match state.elements.get(&transaction) {
            Some(element) => (element.is_free(), element.is_removable()),
            None => return,
        };
        if free {
            self.detector.lock_released(&self.resource, transaction);
        }
        if removable {
            state.elements.remove(&transaction);
        }
    }

    fn notify(&self, woken: Vec<TransactionId>) {
        if !woken.is_empty() {
            trace!("Release of {} woke {:?}", self.resource, woken);
        }
    }

    fn not_found(&self, transaction: TransactionId) -> LockError {
        error!("{} released a lock it does not hold on {}", transaction, self.resource);
        LockError::LockNotFound {
            resource: self.resource,
            transaction,
        }
    }

    /// Mark every pending request of `transaction` as terminated and wake it
    pub fn terminate_requests(&self, transaction: TransactionId) {
        let mut state = self.state.lock();
        let Some(element) = state.elements.get_mut(&transaction) else {
            return;
        };
        element.terminated = true;
        let nudged = state.waiting.nudge_transaction(transaction);
        if nudged > 0 {
            trace!("Terminated {} on {}, woke {} waiters", transaction, self.resource, nudged);
        }
    }

    pub fn holds_read(&self, transaction: TransactionId, interval: &TimeInterval) -> bool {
        self.state
            .lock()
            .elements
            .get(&transaction)
            .is_some_and(|e| e.read_intervals.contains(interval))
    }

    /// The threshold `transaction` holds, if any
    pub fn write_threshold_of(&self, transaction: TransactionId) -> Option<i64> {
        self.state
            .lock()
            .elements
            .get(&transaction)
            .and_then(|e| e.write_threshold)
    }

    /// The threshold currently held by any transaction
    pub fn write_threshold(&self) -> Option<i64> {
        self.state.lock().write_threshold
    }

    /// Union of all transactions' read ranges
    pub fn read_intervals(&self) -> TimeIntervalList {
        self.state.lock().read_intervals.clone()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn tx_element_count(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn max_wait_time(&self) -> Duration {
        self.state.lock().waiting.max_wait_time()
    }

    pub fn describe(&self) -> String {
        self.state.lock().describe(&self.resource)
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            resource: self.resource,
            holders: state.holders(),
            waiting: state.waiting.len(),
        }
    }

    pub(crate) fn mark(&self) {
        self.state.lock().marked += 1;
    }

    pub(crate) fn unmark(&self) {
        let mut state = self.state.lock();
        state.marked = state.marked.saturating_sub(1);
    }

    pub(crate) fn is_unused(&self) -> bool {
        let state = self.state.lock();
        state.marked == 0 && state.elements.is_empty()
    }
}

impl fmt::Debug for TemporalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporalLock")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}
