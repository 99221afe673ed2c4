//! Per-resource lock state machines
//!
//! Two implementations sit behind one closed enum:
//!
//! - [`PlainLock`] - classic counting read/write lock for records
//! - [`TemporalLock`] - interval lock for time-versioned properties, where
//!   reads hold time ranges and a write holds a single time point
//!
//! Both keep all of their state behind one mutex. Each blocked request
//! parks on its own condition variable and is woken only when a release
//! dequeues it or its transaction is terminated. A woken thread always
//! re-checks its admission predicate before proceeding.

mod element;
mod plain;
mod request;
mod temporal;

pub use plain::PlainLock;
pub use temporal::TemporalLock;

use crate::config::LockConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tgraph_common::{ResourceKey, TimeIntervalList, TransactionId};

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock for reading
    Read,
    /// Exclusive lock for writing
    Write,
}

/// Outcome of a blocking acquisition that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Granted,
    /// The owning transaction was terminated while waiting; nothing is held
    Terminated,
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted)
    }
}

/// What one transaction holds on a resource, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HolderSnapshot {
    Plain {
        transaction: TransactionId,
        read_count: u32,
        write_count: u32,
    },
    Temporal {
        transaction: TransactionId,
        read_intervals: TimeIntervalList,
        write_threshold: Option<i64>,
    },
}

/// Point-in-time view of one resource's lock state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub resource: ResourceKey,
    pub holders: Vec<HolderSnapshot>,
    pub waiting: usize,
}

/// Lock state machine for one resource, chosen by resource type
#[derive(Debug)]
pub enum ResourceLock {
    Plain(PlainLock),
    Temporal(TemporalLock),
}

impl ResourceLock {
    pub fn new(
        resource: ResourceKey,
        detector: Arc<dyn DeadlockDetector>,
        config: &LockConfig,
    ) -> Self {
        if resource.resource_type.is_temporal() {
            ResourceLock::Temporal(TemporalLock::new(resource, detector, config))
        } else {
            ResourceLock::Plain(PlainLock::new(resource, detector, config))
        }
    }

    pub fn resource(&self) -> &ResourceKey {
        match self {
            ResourceLock::Plain(lock) => lock.resource(),
            ResourceLock::Temporal(lock) => lock.resource(),
        }
    }

    pub fn as_plain(&self) -> Result<&PlainLock> {
        match self {
            ResourceLock::Plain(lock) => Ok(lock),
            ResourceLock::Temporal(lock) => Err(LockError::ResourceTypeMismatch {
                resource: *lock.resource(),
                expected: "plain",
            }),
        }
    }

    pub fn as_temporal(&self) -> Result<&TemporalLock> {
        match self {
            ResourceLock::Temporal(lock) => Ok(lock),
            ResourceLock::Plain(lock) => Err(LockError::ResourceTypeMismatch {
                resource: *lock.resource(),
                expected: "temporal",
            }),
        }
    }

    /// Mark every request of `transaction` as terminated and wake its waiters
    pub fn terminate_requests(&self, transaction: TransactionId) {
        match self {
            ResourceLock::Plain(lock) => lock.terminate_requests(transaction),
            ResourceLock::Temporal(lock) => lock.terminate_requests(transaction),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ResourceLock::Plain(lock) => lock.describe(),
            ResourceLock::Temporal(lock) => lock.describe(),
        }
    }

    pub fn waiting_count(&self) -> usize {
        match self {
            ResourceLock::Plain(lock) => lock.waiting_count(),
            ResourceLock::Temporal(lock) => lock.waiting_count(),
        }
    }

    pub fn tx_element_count(&self) -> usize {
        match self {
            ResourceLock::Plain(lock) => lock.tx_element_count(),
            ResourceLock::Temporal(lock) => lock.tx_element_count(),
        }
    }

    pub fn max_wait_time(&self) -> Duration {
        match self {
            ResourceLock::Plain(lock) => lock.max_wait_time(),
            ResourceLock::Temporal(lock) => lock.max_wait_time(),
        }
    }

    pub fn snapshot(&self) -> LockSnapshot {
        match self {
            ResourceLock::Plain(lock) => lock.snapshot(),
            ResourceLock::Temporal(lock) => lock.snapshot(),
        }
    }

    /// Pin the lock in the manager's table while an acquisition is pending
    pub(crate) fn mark(&self) {
        match self {
            ResourceLock::Plain(lock) => lock.mark(),
            ResourceLock::Temporal(lock) => lock.mark(),
        }
    }

    pub(crate) fn unmark(&self) {
        match self {
            ResourceLock::Plain(lock) => lock.unmark(),
            ResourceLock::Temporal(lock) => lock.unmark(),
        }
    }

    /// No pending acquisition and no transaction bookkeeping left
    pub(crate) fn is_unused(&self) -> bool {
        match self {
            ResourceLock::Plain(lock) => lock.is_unused(),
            ResourceLock::Temporal(lock) => lock.is_unused(),
        }
    }
}
