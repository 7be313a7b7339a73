//! Contention management for the CAS retry loops.
//!
//! After `n` consecutive lost races a caller waits roughly `min_delay * 2^n`
//! plus a random jitter, never longer than `max_delay`. The jitter keeps
//! threads that lost the same race from retrying in lockstep.

use std::env::{self, VarError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::{ConfigError, Interrupt, StackError};

pub(crate) const MIN_DELAY_ENV: &str = "BACKOFF_STACK_MIN_DELAY_US";
pub(crate) const MAX_DELAY_ENV: &str = "BACKOFF_STACK_MAX_DELAY_US";
pub(crate) const JITTER_ENV: &str = "BACKOFF_STACK_JITTER_US";

/// Bounds for the backoff governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first lost race; doubles with every further loss.
    pub min_delay: Duration,
    /// Cap on any single delay, jitter included.
    pub max_delay: Duration,
    /// Exclusive upper bound of the uniform jitter added to each delay.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(20),
            jitter: Duration::from_millis(10),
        }
    }
}

impl BackoffConfig {
    /// Microsecond-scale waits, for short critical sections and tests.
    pub fn low_latency() -> Self {
        Self {
            min_delay: Duration::from_micros(1),
            max_delay: Duration::from_micros(100),
            jitter: Duration::from_micros(1),
        }
    }

    /// Defaults overridden by `BACKOFF_STACK_MIN_DELAY_US`,
    /// `BACKOFF_STACK_MAX_DELAY_US` and `BACKOFF_STACK_JITTER_US`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(min_delay) = env_micros(MIN_DELAY_ENV)? {
            config.min_delay = min_delay;
        }
        if let Some(max_delay) = env_micros(MAX_DELAY_ENV)? {
            config.max_delay = max_delay;
        }
        if let Some(jitter) = env_micros(JITTER_ENV)? {
            config.jitter = jitter;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay.is_zero() {
            return Err(ConfigError::ZeroMinDelay);
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

fn env_micros(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(value) => parse_micros(key, &value).map(Some),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(value)) => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string_lossy().into_owned(),
        }),
    }
}

fn parse_micros(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_micros)
        .map_err(|_| ConfigError::InvalidEnv {
            key,
            value: value.to_owned(),
        })
}

/// The backoff governor. Holds no shared state, only its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            config: BackoffConfig::default(),
        }
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Backoff { config })
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// `min_delay * 2^failures`, saturating at `max_delay`. No jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);

        self.config
            .min_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// [`base_delay`](Self::base_delay) plus jitter, capped at `max_delay`.
    pub fn delay(&self, failures: u32) -> Duration {
        let jitter = if self.config.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.config.jitter)
        };

        self.base_delay(failures)
            .saturating_add(jitter)
            .min(self.config.max_delay)
    }

    /// Waits [`delay(failures)`](Self::delay).
    ///
    /// Without an `interrupt` this is a plain sleep. With one, the wait parks
    /// until the deadline and returns [`StackError::InterruptedWait`] as soon
    /// as the flag is seen set, leaving it set. A flag that is already set
    /// fails the wait immediately. The waiting thread need not be the one
    /// that created the `Interrupt`.
    pub fn wait(&self, failures: u32, interrupt: Option<&Interrupt>) -> Result<(), StackError> {
        let Some(interrupt) = interrupt else {
            self.wait_uninterruptible(failures);
            return Ok(());
        };

        let delay = self.delay(failures);

        tracing::trace!(failures, ?delay, "lost CAS race, backing off");

        let _registration = interrupt.register();
        let deadline = Instant::now().checked_add(delay);

        loop {
            if interrupt.is_interrupted() {
                tracing::debug!(failures, ?delay, "backoff wait interrupted");
                return Err(StackError::InterruptedWait);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    /// Sleeps [`delay(failures)`](Self::delay) with no way to cut it short.
    pub(crate) fn wait_uninterruptible(&self, failures: u32) {
        let delay = self.delay(failures);

        tracing::trace!(failures, ?delay, "lost CAS race, backing off");

        thread::sleep(delay);
    }
}
