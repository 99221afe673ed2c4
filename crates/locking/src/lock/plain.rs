//! Counting read/write lock for ordinary records
//!
//! Any number of transactions may read, one may write. A transaction is
//! never blocked by its own holdings: it may read while it writes, and it may
//! upgrade to write when it is the only reader.
//!
//! Releases wake only the requests their scan dequeues.

use super::element::PlainElement;
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
use tgraph_common::{ResourceKey, TransactionId};
use tracing::{error, trace, warn};

#[derive(Debug, Default)]
struct PlainState {
    total_read: u32,
    total_write: u32,
    waiting: WaitingList,
    elements: HashMap<TransactionId, PlainElement>,
    marked: usize,
}

impl PlainState {
    fn counts(&self, transaction: TransactionId) -> (u32, u32) {
        self.elements
            .get(&transaction)
            .map_or((0, 0), |e| (e.read_count, e.write_count))
    }

    /// No other transaction writes
    fn readable_by(&self, transaction: TransactionId) -> bool {
        let (_, writes) = self.counts(transaction);
        self.total_write == writes
    }

    /// No other transaction reads or writes
    fn writable_by(&self, transaction: TransactionId) -> bool {
        let (reads, writes) = self.counts(transaction);
        self.total_write == writes && self.total_read == reads
    }

    fn admits(&self, transaction: TransactionId, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.readable_by(transaction),
            LockMode::Write => self.writable_by(transaction),
        }
    }

    fn admits_request(&self, request: &LockRequest) -> bool {
        self.admits(request.transaction, request.mode)
    }

    fn is_terminated(&self, transaction: TransactionId) -> bool {
        self.elements
            .get(&transaction)
            .is_some_and(|e| e.terminated)
    }

    /// Record a granted request. Returns true if the transaction held nothing before.
    fn register(&mut self, transaction: TransactionId, mode: LockMode) -> bool {
        let element = self.elements.entry(transaction).or_default();
        let first = element.is_free();
        match mode {
            LockMode::Read => {
                element.read_count += 1;
                self.total_read += 1;
            }
            LockMode::Write => {
                element.write_count += 1;
                self.total_write += 1;
            }
        }
        first
    }

    /// Dequeue waiters after a read was released
    fn wake_after_read_release(&mut self) -> Vec<TransactionId> {
        let mut woken = Vec::new();
        let Some(last) = self.waiting.back() else {
            return woken;
        };
        let (mode, admissible) = (last.mode, self.admits_request(last));

        match mode {
            LockMode::Write if admissible => {
                if let Some(request) = self.waiting.pop_back() {
                    woken.push(request.transaction);
                    request.wake();
                }
            }
            LockMode::Write => {
                // look past the blocked writer for anyone who can go
                let mut index = self.waiting.len() - 1;
                while index > 0 {
                    index -= 1;
                    let Some(request) = self.waiting.get(index) else {
                        break;
                    };
                    let (mode, admissible) = (request.mode, self.admits_request(request));
                    if !admissible {
                        continue;
                    }
                    if let Some(request) = self.waiting.remove_at(index) {
                        woken.push(request.transaction);
                        request.wake();
                    }
                    if mode == LockMode::Write {
                        break;
                    }
                }
            }
            LockMode::Read => {
                if self.total_write == 0 {
                    if let Some(request) = self.waiting.pop_back() {
                        woken.push(request.transaction);
                        request.wake();
                    }
                }
            }
        }
        woken
    }

    /// Dequeue waiters after a write was released
    fn wake_after_write_release(&mut self) -> Vec<TransactionId> {
        let mut woken = Vec::new();
        if self.total_write != 0 {
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
            .map(|(tx, e)| HolderSnapshot::Plain {
                transaction: *tx,
                read_count: e.read_count,
                write_count: e.write_count,
            })
            .collect();
        holders.sort_by_key(|h| match h {
            HolderSnapshot::Plain { transaction, .. }
            | HolderSnapshot::Temporal { transaction, .. } => *transaction,
        });
        holders
    }

    fn describe(&self, resource: &ResourceKey) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "PlainLock[{}] total read count={} total write count={}",
            resource, self.total_read, self.total_write
        );
        let _ = writeln!(out, "Waiting list:");
        for request in self.waiting.iter() {
            let _ = writeln!(
                out,
                "  [{} {:?} waiting {:?}]",
                request.transaction,
                request.mode,
                request.since.elapsed()
            );
        }
        let _ = writeln!(out, "Locking transactions:");
        for (tx, element) in &self.elements {
            let _ = writeln!(
                out,
                "  {} (r={}, w={})",
                tx, element.read_count, element.write_count
            );
        }
        out
    }
}

/// Read/write lock for one ordinary resource
pub struct PlainLock {
    resource: ResourceKey,
    state: Mutex<PlainState>,
    detector: Arc<dyn DeadlockDetector>,
    log_deadlocks: bool,
}

impl PlainLock {
    pub fn new(
        resource: ResourceKey,
        detector: Arc<dyn DeadlockDetector>,
        config: &LockConfig,
    ) -> Self {
        Self {
            resource,
            state: Mutex::new(PlainState::default()),
            detector,
            log_deadlocks: config.log_deadlocks,
        }
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    pub fn acquire_read(&self, transaction: TransactionId) -> Result<Acquisition> {
        self.acquire(transaction, LockMode::Read)
    }

    pub fn acquire_write(&self, transaction: TransactionId) -> Result<Acquisition> {
        self.acquire(transaction, LockMode::Write)
    }

    pub fn try_acquire_read(&self, transaction: TransactionId) -> bool {
        self.try_acquire(transaction, LockMode::Read)
    }

    pub fn try_acquire_write(&self, transaction: TransactionId) -> bool {
        self.try_acquire(transaction, LockMode::Write)
    }

    fn acquire(&self, transaction: TransactionId, mode: LockMode) -> Result<Acquisition> {
        let mut state = self.state.lock();
        state.elements.entry(transaction).or_default().requests += 1;

        let mut ticket: Option<WaitTicket> = None;
        let mut enqueue = true;
        let outcome = loop {
            if state.is_terminated(transaction) {
                break Ok(Acquisition::Terminated);
            }
            if state.admits(transaction, mode) {
                if state.register(transaction, mode) {
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
                let (queued, waiting) = LockRequest::new(transaction, mode, None);
                state.waiting.push_front(queued);
                ticket = Some(waiting);
            }

            trace!("{} waiting on {} for {:?}", transaction, self.resource, mode);
            if let Some(ticket) = ticket.as_ref() {
                ticket.wait(&mut state);
            }

            enqueue = ticket.as_ref().is_some_and(WaitTicket::was_woken);
            self.detector.stop_wait_on(&self.resource, transaction);
        };

        if let Some(ticket) = ticket.as_ref().filter(|t| !t.was_woken()) {
            state.waiting.remove(ticket);
        }

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
        outcome
    }

    fn try_acquire(&self, transaction: TransactionId, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if state.is_terminated(transaction) || !state.admits(transaction, mode) {
            return false;
        }
        if state.register(transaction, mode) {
            self.detector.lock_acquired(&self.resource, transaction);
        }
        true
    }

    pub fn release_read(&self, transaction: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        match state.elements.get_mut(&transaction) {
            Some(element) if element.read_count > 0 => element.read_count -= 1,
            _ => return Err(self.not_found(transaction)),
        }
        state.total_read -= 1;

        self.after_release(&mut state, transaction);
        let woken = state.wake_after_read_release();
        self.notify(woken);
        Ok(())
    }

    pub fn release_write(&self, transaction: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        match state.elements.get_mut(&transaction) {
            Some(element) if element.write_count > 0 => element.write_count -= 1,
            _ => return Err(self.not_found(transaction)),
        }
        state.total_write -= 1;

        self.after_release(&mut state, transaction);
        let woken = state.wake_after_write_release();
        self.notify(woken);
        Ok(())
    }

    fn after_release(&self, state: &mut PlainState, transaction: TransactionId) {
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

    /// Read and write counts held by `transaction`
    pub fn held_by(&self, transaction: TransactionId) -> (u32, u32) {
        self.state.lock().counts(transaction)
    }

    pub fn read_count(&self) -> u32 {
        self.state.lock().total_read
    }

    pub fn write_count(&self) -> u32 {
        self.state.lock().total_write
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

impl fmt::Debug for PlainLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainLock")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadlock::NoDeadlockDetection;
    use tgraph_common::ResourceType;

    fn lock() -> PlainLock {
        PlainLock::new(
            ResourceKey::normal(ResourceType::Node, 7),
            Arc::new(NoDeadlockDetection),
            &LockConfig::default(),
        )
    }

    fn queue(state: &mut PlainState, tx: TransactionId, mode: LockMode) -> WaitTicket {
        state.elements.entry(tx).or_default().requests += 1;
        let (request, ticket) = LockRequest::new(tx, mode, None);
        state.waiting.push_front(request);
        ticket
    }

    #[test]
    fn test_readers_share() {
        let lock = lock();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();

        assert!(lock.try_acquire_read(t1));
        assert!(lock.try_acquire_read(t2));
        assert!(!lock.try_acquire_write(t1));
        assert_eq!(lock.read_count(), 2);
    }

    #[test]
    fn test_writer_excludes_others() {
        let lock = lock();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();

        assert!(lock.try_acquire_write(t1));
        assert!(!lock.try_acquire_read(t2));
        assert!(!lock.try_acquire_write(t2));

        // the writer itself can stack reads and writes
        assert!(lock.try_acquire_read(t1));
        assert!(lock.try_acquire_write(t1));
        assert_eq!(lock.held_by(t1), (1, 2));
    }

    #[test]
    fn test_sole_reader_upgrades() {
        let lock = lock();
        let tx = TransactionId::new();
        assert!(lock.try_acquire_read(tx));
        assert!(lock.try_acquire_write(tx));
    }

    #[test]
    fn test_release_without_hold_fails() {
        let lock = lock();
        let tx = TransactionId::new();
        assert!(matches!(
            lock.release_read(tx),
            Err(LockError::LockNotFound { .. })
        ));

        assert!(lock.try_acquire_read(tx));
        assert!(lock.release_write(tx).is_err());
        lock.release_read(tx).unwrap();
        assert!(lock.is_unused());
    }

    #[test]
    fn test_blocking_acquire_grants_when_free() {
        let lock = lock();
        let tx = TransactionId::new();
        assert_eq!(lock.acquire_write(tx).unwrap(), Acquisition::Granted);
        assert_eq!(lock.tx_element_count(), 1);
        lock.release_write(tx).unwrap();
        assert_eq!(lock.tx_element_count(), 0);
    }

    #[test]
    fn test_read_release_wakes_admissible_writer_at_back() {
        let mut state = PlainState::default();
        let writer = TransactionId::new();
        let reader = TransactionId::new();
        let ticket = queue(&mut state, writer, LockMode::Write);
        queue(&mut state, reader, LockMode::Read);

        assert_eq!(state.wake_after_read_release(), vec![writer]);
        assert!(ticket.was_woken());
        assert_eq!(state.waiting.len(), 1);
    }

    #[test]
    fn test_read_release_skips_blocked_writer() {
        let mut state = PlainState::default();
        let holder = TransactionId::new();
        state.register(holder, LockMode::Read);

        let blocked = TransactionId::new();
        let r1 = TransactionId::new();
        let r2 = TransactionId::new();
        let w = TransactionId::new();
        let r3 = TransactionId::new();
        queue(&mut state, blocked, LockMode::Write);
        queue(&mut state, r1, LockMode::Read);
        queue(&mut state, r2, LockMode::Read);
        queue(&mut state, w, LockMode::Write);
        queue(&mut state, r3, LockMode::Read);

        // holder's read keeps every writer out, so readers go and writers stay
        assert_eq!(state.wake_after_read_release(), vec![r1, r2, r3]);
        assert_eq!(state.waiting.len(), 2);
        assert_eq!(state.waiting.back().map(|r| r.transaction), Some(blocked));
    }

    #[test]
    fn test_read_release_reader_at_back_waits_for_writer() {
        let mut state = PlainState::default();
        let writer = TransactionId::new();
        state.register(writer, LockMode::Write);
        queue(&mut state, TransactionId::new(), LockMode::Read);

        assert!(state.wake_after_read_release().is_empty());
    }

    #[test]
    fn test_write_release_drains_until_first_writer() {
        let mut state = PlainState::default();
        let r1 = TransactionId::new();
        let w1 = TransactionId::new();
        let w2 = TransactionId::new();
        queue(&mut state, r1, LockMode::Read);
        queue(&mut state, w1, LockMode::Write);
        queue(&mut state, w2, LockMode::Write);

        assert_eq!(state.wake_after_write_release(), vec![r1, w1]);
        assert_eq!(state.waiting.len(), 1);
    }

    #[test]
    fn test_write_release_leaves_later_requests_parked() {
        let lock = Arc::new(lock());
        let holder = TransactionId::new();
        let first = TransactionId::new();
        let second = TransactionId::new();
        assert!(lock.try_acquire_write(holder));

        let spawn_write = |tx: TransactionId| {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire_write(tx))
        };
        let first_handle = spawn_write(first);
        while lock.waiting_count() < 1 {
            std::thread::yield_now();
        }
        let second_handle = spawn_write(second);
        while lock.waiting_count() < 2 {
            std::thread::yield_now();
        }

        // the oldest writer is the only one dequeued, so it always wins
        lock.release_write(holder).unwrap();
        assert_eq!(first_handle.join().unwrap().unwrap(), Acquisition::Granted);
        assert_eq!(lock.held_by(first), (0, 1));
        assert_eq!(lock.waiting_count(), 1);

        lock.release_write(first).unwrap();
        assert_eq!(second_handle.join().unwrap().unwrap(), Acquisition::Granted);
        assert_eq!(lock.waiting_count(), 0);
    }
}
