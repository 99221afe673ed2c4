//! Per-transaction bookkeeping on one resource

use tgraph_common::TimeIntervalList;

/// What one transaction holds and is requesting on a plain lock
#[derive(Debug, Default)]
pub(crate) struct PlainElement {
    pub(crate) read_count: u32,
    pub(crate) write_count: u32,
    /// Acquisition attempts in flight; the element must outlive them
    pub(crate) requests: u32,
    pub(crate) terminated: bool,
}

impl PlainElement {
    pub(crate) fn is_free(&self) -> bool {
        self.read_count == 0 && self.write_count == 0
    }

    /// Free and not referenced by any in-flight acquisition
    pub(crate) fn is_removable(&self) -> bool {
        self.is_free() && self.requests == 0
    }
}

/// What one transaction holds and is requesting on an interval lock
#[derive(Debug, Default)]
pub(crate) struct TemporalElement {
    /// This transaction's own read ranges
    pub(crate) read_intervals: TimeIntervalList,
    /// The point this transaction writes at, if it holds the write threshold
    pub(crate) write_threshold: Option<i64>,
    pub(crate) requests: u32,
    pub(crate) terminated: bool,
}

impl TemporalElement {
    pub(crate) fn is_free(&self) -> bool {
        self.read_intervals.is_empty() && self.write_threshold.is_none()
    }

    pub(crate) fn is_removable(&self) -> bool {
        self.is_free() && self.requests == 0
    }
}
