//! Retry/backoff policy used only inside [`crate::registry::HttpRegistryClient`].
//!
//! The tree replication engine itself never retries an operation (§7 of the
//! design doc places backend-layer retry outside the engine's concerns);
//! this module exists because the one concrete adapter this crate ships is
//! a complete backend and therefore owns its own retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{FailureKind, deserialize_duration, serialize_duration};

/// Strategy for calculating delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Predefined retry policies with sensible defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    Default,
    Aggressive,
    Conservative,
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default)]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default)]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.5,
        }
    }
}

fn default_jitter() -> f64 {
    0.5
}

/// Per-error-class overrides of the default retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerErrorConfig {
    #[serde(default)]
    pub transient_transport: Option<RetryStrategyConfig>,
    #[serde(default)]
    pub digest_mismatch: Option<RetryStrategyConfig>,
}

pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Resolve the retry configuration to use for one failure kind, falling
/// back to the default config when no override is configured. Only
/// transient transport and digest-mismatch failures are ever retried by
/// the adapter; other kinds are terminal (§7 of the design doc).
pub fn config_for_failure(
    default_config: &RetryStrategyConfig,
    per_error: &Option<PerErrorConfig>,
    kind: FailureKind,
) -> Option<RetryStrategyConfig> {
    match kind {
        FailureKind::TransientTransport => Some(
            per_error
                .as_ref()
                .and_then(|p| p.transient_transport.clone())
                .unwrap_or_else(|| default_config.clone()),
        ),
        FailureKind::DigestMismatch => Some(
            per_error
                .as_ref()
                .and_then(|p| p.digest_mismatch.clone())
                .unwrap_or_else(|| default_config.clone()),
        ),
        FailureKind::NotFound
        | FailureKind::AuthPermission
        | FailureKind::InvalidCredentialConfig
        | FailureKind::Cancelled => None,
    }
}
