//! Bounded retry strategies for flaky test runs.
//!
//! This crate provides:
//! - Delay strategies (immediate, constant, linear, exponential) with optional jitter
//! - Presets for whole-suite retries and per-test retries
//! - A [`RetryExecutor`] that runs an operation until it succeeds or the
//!   attempt budget is spent
//!
//! # Example
//!
//! ```
//! use droidci_retry::{RetryExecutor, RetryStrategyConfig, RetryStrategyType};
//! use std::time::Duration;
//!
//! let executor = RetryExecutor::new(RetryStrategyConfig {
//!     strategy: RetryStrategyType::Immediate,
//!     max_attempts: 3,
//!     base_delay: Duration::ZERO,
//!     max_delay: Duration::ZERO,
//!     jitter: 0.0,
//! });
//! let result = executor.run(|attempt| if attempt == 2 { Ok(attempt) } else { Err(()) });
//! assert_eq!(result, Ok(2));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between attempts
    Immediate,
    /// Same delay before every attempt (default)
    #[default]
    Constant,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay doubles each attempt
    Exponential,
}

/// Configuration for a bounded retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between attempts.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for the strategy.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap applied after the strategy is evaluated.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 1.0 = full).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self::suite()
    }
}

impl RetryStrategyConfig {
    /// Whole-suite retries: 3 attempts, 10 seconds before each.
    pub fn suite() -> Self {
        Self {
            strategy: RetryStrategyType::Constant,
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    /// Per-test retries: 3 back-to-back attempts.
    pub fn per_test() -> Self {
        Self {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

/// Calculate the delay before `attempt` (1-indexed).
///
/// ```
/// use droidci_retry::{RetryStrategyConfig, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig::suite();
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(10));
/// assert_eq!(calculate_delay(&config, 3), Duration::from_secs(10));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => return Duration::ZERO,
        RetryStrategyType::Constant => config.base_delay,
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
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
    let random_value: f64 = rand::random();
    let factor = 1.0 - jitter + (random_value * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Runs a fallible operation up to `max_attempts` times.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryStrategyConfig {
        &self.config
    }

    /// Run `operation` until it returns `Ok` or attempts are exhausted.
    ///
    /// The operation receives the current attempt number (starting at 1).
    /// The last error is returned when every attempt fails. With
    /// `max_attempts == 0` the operation still runs once.
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_hook(operation, |_, _| {})
    }

    /// Like [`RetryExecutor::run`], calling `on_retry(next_attempt, delay)`
    /// before sleeping ahead of each further attempt.
    pub fn run_with_hook<T, E, F, H>(&self, mut operation: F, mut on_retry: H) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        H: FnMut(u32, Duration),
    {
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }

                    attempt += 1;
                    let delay = calculate_delay(&self.config, attempt);
                    on_retry(attempt, delay);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }
}
