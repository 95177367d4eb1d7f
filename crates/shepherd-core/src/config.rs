//! Runtime parameters for deploys and discovery

use std::time::Duration;

/// Retry and deadline policy applied to every deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployPolicy {
    /// Dispatch attempts before giving up; `0` retries until `abandon_after`
    pub retries: u32,
    /// How long each attempt waits for the agent's ack
    pub attempt_timeout: Duration,
    /// Ceiling on the whole send/ack phase, measured from the first attempt
    pub abandon_after: Duration,
    /// How long to wait for a terminal outcome once acked
    pub completion_timeout: Duration,
}

impl Default for DeployPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            attempt_timeout: Duration::from_secs(5),
            abandon_after: Duration::from_secs(60 * 60),
            completion_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Timing of one discovery cycle and the loop around it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Delay between subscribing to pongs and publishing the ping
    pub ping_delay: Duration,
    /// How long pongs are collected per cycle
    pub window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            ping_delay: Duration::from_millis(500),
            window: Duration::from_secs(2),
        }
    }
}
