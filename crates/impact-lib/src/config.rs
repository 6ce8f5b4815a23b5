//! Engine configuration
//!
//! Process-wide defaults are carried explicitly in [`EngineConfig`] and
//! handed to the controller, the model and the nodes.

use crate::error::{ImpactError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub defaults: ModelDefaults,
    #[serde(default)]
    pub attribution: AttributionConfig,
}

/// Bounded-parallelism and retry settings for outbound calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum requests in flight against one upstream account
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before retry `n` is `backoff_base_secs ^ n` seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,

    /// Optional ceiling on a single backoff delay
    #[serde(default)]
    pub max_backoff_secs: Option<f64>,

    /// Deadline for one attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: f64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    7
}

fn default_backoff_base_secs() -> f64 {
    5.0
}

fn default_attempt_timeout_secs() -> f64 {
    30.0
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            max_backoff_secs: None,
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl ConcurrencyConfig {
    /// Reject settings that would stall or never retry
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ImpactError::PermanentConfig(msg));
        if !(self.attempt_timeout_secs.is_finite() && self.attempt_timeout_secs > 0.0) {
            return invalid(format!(
                "attempt_timeout_secs must be positive and finite, got {}",
                self.attempt_timeout_secs
            ));
        }
        if !(self.backoff_base_secs.is_finite() && self.backoff_base_secs >= 0.0) {
            return invalid(format!(
                "backoff_base_secs must be non-negative and finite, got {}",
                self.backoff_base_secs
            ));
        }
        if let Some(cap) = self.max_backoff_secs {
            if cap.is_nan() || cap < 0.0 {
                return invalid(format!("max_backoff_secs must be non-negative, got {}", cap));
            }
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".to_string());
        }
        Ok(())
    }

    /// Deadline for one attempt; out-of-range values saturate
    pub fn attempt_timeout(&self) -> Duration {
        saturating_secs(self.attempt_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.backoff_base_secs.max(0.0).powi(exponent);
        if let Some(cap) = self.max_backoff_secs {
            secs = secs.min(cap.max(0.0));
        }
        saturating_secs(secs)
    }
}

fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Fallback constants used when static parameters or observations are
/// incomplete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default = "default_carbon_intensity")]
    pub carbon_intensity: f64,
    #[serde(default = "default_tdp_watts")]
    pub tdp_watts: f64,
    #[serde(default = "default_reserved_cores")]
    pub reserved_cores: f64,
    #[serde(default = "default_total_vcpus")]
    pub total_vcpus: f64,
    #[serde(default = "default_embodied_carbon_kg")]
    pub embodied_carbon_kg: f64,
    /// Expected hardware lifespan (EL), 4 years
    #[serde(default = "default_lifespan_hours")]
    pub lifespan_hours: f64,
    #[serde(default = "default_memory_watts_per_gb")]
    pub memory_watts_per_gb: f64,
}

fn default_carbon_intensity() -> f64 {
    100.0
}

fn default_tdp_watts() -> f64 {
    200.0
}

fn default_reserved_cores() -> f64 {
    2.0
}

fn default_total_vcpus() -> f64 {
    16.0
}

fn default_embodied_carbon_kg() -> f64 {
    1200.0
}

fn default_lifespan_hours() -> f64 {
    35_040.0
}

fn default_memory_watts_per_gb() -> f64 {
    0.38
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            carbon_intensity: default_carbon_intensity(),
            tdp_watts: default_tdp_watts(),
            reserved_cores: default_reserved_cores(),
            total_vcpus: default_total_vcpus(),
            embodied_carbon_kg: default_embodied_carbon_kg(),
            lifespan_hours: default_lifespan_hours(),
            memory_watts_per_gb: default_memory_watts_per_gb(),
        }
    }
}

/// What an aggregate does with a child that failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Leave the child out of the sum and record it in metadata
    #[default]
    ContributeZero,
    /// Fail the whole aggregate
    FailClosed,
}

/// Attribution and aggregation behavior
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Clamp utilization ratios to `[0, 1]`
    #[serde(default)]
    pub clamp_ratios: bool,
    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,
}
