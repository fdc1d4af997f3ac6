//! Reconnect back-off schedule.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

use crate::config::ChannelConfig;

/// Exponential reconnect schedule: `min(base * 2^attempt, max)` for at most
/// `max_attempts` attempts, without jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for ReconnectPolicy {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Build the backoff strategy
    fn strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts as usize)
    }

    /// Delay before reconnect number `attempt + 1`, or `None` once
    /// `attempt` reconnects have already been made and the budget is spent
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        self.strategy().build().nth(attempt as usize)
    }

    /// Every delay of the schedule, in order
    pub fn schedule(&self) -> Vec<Duration> {
        self.strategy().build().collect()
    }
}
