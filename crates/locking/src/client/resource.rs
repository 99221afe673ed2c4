//! Client-side record of one held resource

use tgraph_common::{ResourceKey, TimeInterval, TimeIntervalList};

/// A resource held by a client in one mode.
///
/// Only the first local acquisition reaches the lock manager; later ones bump
/// `ref_count`. Temporal resources also remember each range or point that
/// was forwarded, so a repeated acquisition of the same one stays local.
#[derive(Debug)]
pub(crate) struct LockResource {
    key: ResourceKey,
    ref_count: u32,
    intervals: TimeIntervalList,
}

impl LockResource {
    pub(crate) fn new(key: ResourceKey) -> Self {
        Self {
            key,
            ref_count: 1,
            intervals: TimeIntervalList::new(),
        }
    }

    pub(crate) fn with_interval(key: ResourceKey, interval: TimeInterval) -> Self {
        let mut resource = Self::new(key);
        resource.intervals.insert(interval);
        resource
    }

    pub(crate) fn key(&self) -> ResourceKey {
        self.key
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// Record a newly granted interval and count it as another acquisition
    pub(crate) fn retain_interval(&mut self, interval: TimeInterval) {
        self.intervals.insert(interval);
        self.ref_count += 1;
    }

    /// Drop one reference. Returns true when none are left.
    pub(crate) fn release(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }

    pub(crate) fn holds_interval(&self, interval: &TimeInterval) -> bool {
        self.intervals.contains(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgraph_common::ResourceType;

    #[test]
    fn test_ref_counting() {
        let mut resource = LockResource::new(ResourceKey::normal(ResourceType::Node, 1));
        resource.retain();
        resource.retain();
        assert_eq!(resource.ref_count(), 3);

        assert!(!resource.release());
        assert!(!resource.release());
        assert!(resource.release());
    }

    #[test]
    fn test_intervals_remembered() {
        let key = ResourceKey::temporal(ResourceType::NodeTemporalProp, 1, 5);
        let mut resource = LockResource::with_interval(key, TimeInterval::new(1, 3));
        resource.retain_interval(TimeInterval::new(7, 9));

        assert!(resource.holds_interval(&TimeInterval::new(1, 3)));
        assert!(resource.holds_interval(&TimeInterval::new(7, 9)));
        assert!(!resource.holds_interval(&TimeInterval::new(1, 9)));
        assert_eq!(resource.ref_count(), 2);
    }
}
