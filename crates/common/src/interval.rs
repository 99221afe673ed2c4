//! Closed time intervals and ordered interval lists
//!
//! Time is an integer axis. A single time point `t` is the degenerate
//! interval `[t, t]`, which lets a write at `t` be checked against read
//! ranges with the same overlap test.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed interval `[start, end]` on the time axis.
///
/// `start <= end` is not enforced; an inverted interval overlaps nothing.
/// Ordering is by `start`, then `end`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimeInterval {
    start: i64,
    end: i64,
}

impl TimeInterval {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// The degenerate interval `[time, time]`
    pub const fn point(time: i64) -> Self {
        Self {
            start: time,
            end: time,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Two closed intervals overlap iff `max(starts) <= min(ends)`
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    pub fn contains(&self, time: i64) -> bool {
        self.start <= time && time <= self.end
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Ordered bag of intervals. Equal intervals may appear more than once.
///
/// A list is owned either by one transaction's lock element (its own held
/// read ranges) or by one lock state machine (the union over all holders).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeIntervalList {
    intervals: Vec<TimeInterval>,
}

impl TimeIntervalList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeInterval> {
        self.intervals.iter()
    }

    /// Insert keeping the list sorted. A new interval goes before any equal ones.
    pub fn insert(&mut self, interval: TimeInterval) {
        let pos = self.intervals.partition_point(|t| *t < interval);
        self.intervals.insert(pos, interval);
    }

    /// Remove the first entry structurally equal to `interval`.
    ///
    /// Returns false when no such entry exists; nothing is split or trimmed.
    pub fn remove(&mut self, interval: &TimeInterval) -> bool {
        match self.intervals.iter().position(|t| t == interval) {
            Some(pos) => {
                self.intervals.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Multiset subtraction: each entry of `other` removes one equal entry here.
    pub fn remove_all(&mut self, other: &TimeIntervalList) {
        for interval in &other.intervals {
            self.remove(interval);
        }
    }

    pub fn contains(&self, interval: &TimeInterval) -> bool {
        self.intervals.contains(interval)
    }

    /// Does any member overlap `target`?
    pub fn overlaps(&self, target: &TimeInterval) -> bool {
        self.intervals.iter().any(|t| t.overlaps(target))
    }

    /// Does any member of `self - other` overlap `target`?
    ///
    /// The difference is a multiset difference, so when two holders share an
    /// equal interval, exempting one holder's copy still leaves the other's.
    pub fn union_except(&self, other: &TimeIntervalList, target: &TimeInterval) -> bool {
        let mut exempt: Vec<&TimeInterval> = other.intervals.iter().collect();
        for interval in &self.intervals {
            if let Some(pos) = exempt.iter().position(|e| *e == interval) {
                exempt.swap_remove(pos);
                continue;
            }
            if interval.overlaps(target) {
                return true;
            }
        }
        false
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }
}

impl fmt::Display for TimeIntervalList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", interval)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a TimeIntervalList {
    type Item = &'a TimeInterval;
    type IntoIter = std::slice::Iter<'a, TimeInterval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}
