//! Common types for the tgraph lock subsystem
//!
//! This crate defines:
//! - Transaction IDs (UUIDv7-based) used as lock session keys
//! - Closed time intervals and ordered interval lists
//! - The resource-type registry and resource identities that name lockable things

mod interval;
mod resource;
mod transaction_id;

pub use interval::{TimeInterval, TimeIntervalList};
pub use resource::{ResourceIdentity, ResourceKey, ResourceType};
pub use transaction_id::TransactionId;
