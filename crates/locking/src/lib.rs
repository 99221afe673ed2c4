//! Read/write lock manager for a temporal graph store
//!
//! Ordinary records (nodes, relationships, schema, index entries) are guarded
//! by counting read/write locks. Time-versioned properties are guarded by
//! interval locks, where a reader holds a time range and a writer holds a
//! point `t` that covers everything from `t` onward, so transactions working
//! on disjoint parts of a property's history do not block each other.
//!
//! # Architecture
//!
//! - [`LockManager`] keeps one lock state machine per [`ResourceKey`],
//!   created on demand and dropped when nobody holds or waits for it
//! - [`LockClient`] is one transaction's session: it reference-counts local
//!   acquisitions and releases everything on close
//! - [`Locks`] is the service object the application constructs and passes
//!   around
//!
//! Cycle detection is delegated to a [`DeadlockDetector`] consulted before
//! every wait.
//!
//! [`ResourceKey`]: tgraph_common::ResourceKey

pub mod client;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod lock;
pub mod manager;
pub mod service;

pub use client::LockClient;
pub use config::LockConfig;
pub use deadlock::{DeadlockDetected, DeadlockDetector, NoDeadlockDetection};
pub use error::{LockError, Result};
pub use lock::{
    Acquisition, HolderSnapshot, LockMode, LockSnapshot, PlainLock, ResourceLock, TemporalLock,
};
pub use manager::LockManager;
pub use service::Locks;
