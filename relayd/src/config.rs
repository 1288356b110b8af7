use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handlers;
use crate::handlers::config::deserialize_handler_configs;

#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Capacity of the scan-event channel between publisher and consumer.
    pub event_buffer_cap: usize,
    #[serde(with = "humantime_serde")]
    pub event_stream_timeout: Duration,
    /// Pull-transport cadence for new-head checks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound on waiting for a destination transaction to confirm.
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub rpc_retry_delay: Duration,
    pub rpc_retry_max_attempts: u64,
    #[serde(deserialize_with = "deserialize_handler_configs")]
    pub handlers: Vec<handlers::config::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_buffer_cap: 100000,
            event_stream_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(90),
            rpc_retry_delay: Duration::from_secs(1),
            rpc_retry_max_attempts: 3,
            handlers: vec![],
        }
    }
}
