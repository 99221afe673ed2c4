//! Shared helpers for the locking integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tgraph_common::{ResourceKey, ResourceType, TransactionId};
use tgraph_locking::{
    DeadlockDetected, DeadlockDetector, LockConfig, LockManager, NoDeadlockDetection,
};

pub fn manager() -> Arc<LockManager> {
    Arc::new(LockManager::new(
        Arc::new(NoDeadlockDetection),
        LockConfig::default().with_stop_poll_interval(Duration::from_millis(5)),
    ))
}

pub fn node_prop(entity_id: i64, property_key: i32) -> ResourceKey {
    ResourceKey::temporal(ResourceType::NodeTemporalProp, entity_id, property_key)
}

/// Poll until exactly `expected` requests are queued across all locks
pub fn wait_for_waiters(manager: &LockManager, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let waiting: usize = manager.snapshot().iter().map(|s| s.waiting).sum();
        if waiting == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "expected {} waiters, found {}",
            expected,
            waiting
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleEvent {
    WaitStarted,
    WaitEnded,
    Acquired,
    Released,
}

/// Oracle that reports a deadlock for chosen transactions and records every call
#[derive(Default)]
pub struct ScriptedOracle {
    deadlocked: Mutex<HashSet<TransactionId>>,
    events: Mutex<Vec<(OracleEvent, ResourceKey, TransactionId)>>,
}

impl ScriptedOracle {
    pub fn deadlock(&self, transaction: TransactionId) {
        self.deadlocked.lock().insert(transaction);
    }

    pub fn events_for(&self, transaction: TransactionId) -> Vec<OracleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, _, tx)| *tx == transaction)
            .map(|(event, _, _)| *event)
            .collect()
    }

    fn record(&self, event: OracleEvent, resource: &ResourceKey, transaction: TransactionId) {
        self.events.lock().push((event, *resource, transaction));
    }
}

impl DeadlockDetector for ScriptedOracle {
    fn check_wait_on(
        &self,
        resource: &ResourceKey,
        transaction: TransactionId,
    ) -> Result<(), DeadlockDetected> {
        if self.deadlocked.lock().contains(&transaction) {
            return Err(DeadlockDetected::new(*resource, transaction, "scripted cycle"));
        }
        self.record(OracleEvent::WaitStarted, resource, transaction);
        Ok(())
    }

    fn stop_wait_on(&self, resource: &ResourceKey, transaction: TransactionId) {
        self.record(OracleEvent::WaitEnded, resource, transaction);
    }

    fn lock_acquired(&self, resource: &ResourceKey, transaction: TransactionId) {
        self.record(OracleEvent::Acquired, resource, transaction);
    }

    fn lock_released(&self, resource: &ResourceKey, transaction: TransactionId) {
        self.record(OracleEvent::Released, resource, transaction);
    }
}
