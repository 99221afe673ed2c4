//! Error types for the lock subsystem

use crate::deadlock::DeadlockDetected;
use tgraph_common::{ResourceKey, TransactionId};
use thiserror::Error;

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The deadlock oracle found a wait-for cycle through this acquisition
    #[error("Deadlock detected: {transaction} waiting on {resource}: {message}")]
    DeadlockDetected {
        resource: ResourceKey,
        transaction: TransactionId,
        message: String,
    },

    #[error("Lock client for transaction {transaction} has been stopped")]
    ClientStopped { transaction: TransactionId },

    /// Release of a lock the transaction does not hold
    #[error("No lock held by {transaction} on {resource}")]
    LockNotFound {
        resource: ResourceKey,
        transaction: TransactionId,
    },

    /// Reserved for callers that bound acquisition with their own deadline
    #[error("Timed out acquiring lock on {resource}")]
    AcquireTimeout { resource: ResourceKey },

    #[error("Resource {resource} is not a {expected} lock")]
    ResourceTypeMismatch {
        resource: ResourceKey,
        expected: &'static str,
    },

    #[error("Lock service is closed")]
    ServiceClosed,
}

impl From<DeadlockDetected> for LockError {
    fn from(e: DeadlockDetected) -> Self {
        LockError::DeadlockDetected {
            resource: e.resource,
            transaction: e.transaction,
            message: e.message,
        }
    }
}
