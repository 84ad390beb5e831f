//! Engine settings
//!
//! All recognized engine-level options with their defaults. Loadable from
//! the environment through `conflux_common::load_settings` with the
//! `CONFLUX` prefix.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use conflux_common::{load_settings, SettingsError};
use conflux_domain::Step;

use crate::engine::retry::RetryPolicy;

/// Engine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Workers for async/timer steps and parallel branches
    pub async_pool_size: usize,
    /// Workers for retries and periodic cleanup
    pub scheduler_pool_size: usize,
    pub cleanup_interval_minutes: u64,
    pub instance_retention_days: i64,
    pub base_retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub step_default_timeout_seconds: u64,
    pub user_task_default_due_hours: i64,
    pub parallel_default_timeout_ms: u64,
    pub parallel_default_branch_ms: u64,
    /// Grace period for the async pool on shutdown
    pub shutdown_grace_seconds: u64,
    /// Grace period for the scheduler pool on shutdown
    pub scheduler_grace_seconds: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            async_pool_size: 10,
            scheduler_pool_size: 5,
            cleanup_interval_minutes: 60,
            instance_retention_days: 30,
            base_retry_delay_seconds: 1,
            max_retry_delay_seconds: 300,
            step_default_timeout_seconds: 300,
            user_task_default_due_hours: 24,
            parallel_default_timeout_ms: 30_000,
            parallel_default_branch_ms: 10_000,
            shutdown_grace_seconds: 30,
            scheduler_grace_seconds: 10,
        }
    }
}

impl EngineSettings {
    /// Load from `CONFLUX_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, SettingsError> {
        load_settings("CONFLUX")
    }

    /// Retry back-off policy derived from the delay settings
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_secs(self.base_retry_delay_seconds),
            Duration::from_secs(self.max_retry_delay_seconds),
        )
    }

    /// Effective execution deadline for a step
    #[must_use]
    pub fn step_timeout(&self, step: &Step) -> Duration {
        let seconds = step
            .timeout_seconds
            .map_or(self.step_default_timeout_seconds, u64::from);
        Duration::from_secs(seconds)
    }
}
