use std::time::Duration;

use common::utils::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct OrchestratorTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 15 * 60,
            retry_backoff_cap_exponent: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tuning: OrchestratorTuning,
    /// Delay between two polls of the same job.
    pub poll_interval: Duration,
    /// A job still pending after this long gets a warning on every poll.
    pub pending_warning: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for OrchestratorConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tuning: OrchestratorTuning::default(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            pending_warning: Duration::from_secs(config.pending_warning_secs),
        }
    }
}
