//! Lock subsystem configuration

use std::time::Duration;

/// Configuration for the lock manager and its clients
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Sleep between polls while a stopping client drains its active operations
    pub stop_poll_interval: Duration,

    /// Log the state of a resource when the deadlock oracle rejects a wait on it
    pub log_deadlocks: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stop_poll_interval: Duration::from_millis(20),
            log_deadlocks: true,
        }
    }
}

impl LockConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drain poll interval used by `LockClient::stop`
    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    /// Enable or disable lock dumps on deadlock
    pub fn with_log_deadlocks(mut self, enabled: bool) -> Self {
        self.log_deadlocks = enabled;
        self
    }
}
