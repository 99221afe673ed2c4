//! Interface to the deadlock oracle
//!
//! The lock state machines do not detect cycles themselves. Before a thread
//! parks on a resource it asks the oracle whether waiting would close a cycle
//! in the wait-for graph, and it reports every wait end, first acquisition and
//! final release so the oracle can keep its graph current.
//!
//! Every call is made while the resource's mutex is held. Implementations must
//! not call back into the lock manager.

use tgraph_common::{ResourceKey, TransactionId};
use thiserror::Error;

/// Raised by the oracle when waiting on a resource would deadlock
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{transaction} can not wait on {resource}: {message}")]
pub struct DeadlockDetected {
    pub resource: ResourceKey,
    pub transaction: TransactionId,
    pub message: String,
}

impl DeadlockDetected {
    pub fn new(resource: ResourceKey, transaction: TransactionId, message: impl Into<String>) -> Self {
        Self {
            resource,
            transaction,
            message: message.into(),
        }
    }
}

/// Wait-for graph consulted by the lock state machines
pub trait DeadlockDetector: Send + Sync {
    /// Called before `transaction` parks on `resource`
    fn check_wait_on(
        &self,
        resource: &ResourceKey,
        transaction: TransactionId,
    ) -> Result<(), DeadlockDetected>;

    /// Called after a parked transaction wakes up
    fn stop_wait_on(&self, resource: &ResourceKey, transaction: TransactionId);

    /// Called when `transaction` goes from holding nothing to holding something on `resource`
    fn lock_acquired(&self, resource: &ResourceKey, transaction: TransactionId);

    /// Called when `transaction` no longer holds anything on `resource`
    fn lock_released(&self, resource: &ResourceKey, transaction: TransactionId);
}

/// Oracle that never reports a cycle.
///
/// Blocked transactions then only leave a wait when the holder releases or
/// their client is stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeadlockDetection;

impl DeadlockDetector for NoDeadlockDetection {
    fn check_wait_on(&self, _: &ResourceKey, _: TransactionId) -> Result<(), DeadlockDetected> {
        Ok(())
    }

    fn stop_wait_on(&self, _: &ResourceKey, _: TransactionId) {}

    fn lock_acquired(&self, _: &ResourceKey, _: TransactionId) {}

    fn lock_released(&self, _: &ResourceKey, _: TransactionId) {}
}
