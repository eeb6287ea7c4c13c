//! Reconnect schedule.

use std::time::Duration;

/// Delays between reconnect attempts, by zero-based retry index.
pub const DEFAULT_SCHEDULE_MS: [u64; 4] = [1000, 1000, 5000, 15000];

/// Retry index a candidate starts from when it does not bring its own.
/// Equal to the schedule length, so such peers are dialed once and not
/// redialed automatically.
pub const DEFAULT_RETRIES: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    schedule: Vec<Duration>,
    default_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            default_retries: DEFAULT_RETRIES,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, ..Self::default() }
    }

    pub fn from_millis(schedule: &[u64]) -> Self {
        Self::new(schedule.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    /// Delay before redialing a peer whose retry index is `retry`, or `None`
    /// once the schedule is exhausted.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        self.schedule.get(retry as usize).copied()
    }
}
