//! Per-command configuration

use crate::errors::ConfigError;
use std::time::Duration;

/// Backoff applied to the open delay across consecutive open episodes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Every open episode waits the configured delay
    Fixed,
    /// Delay grows by `multiplier` per consecutive open, capped at `max_delay`
    Exponential { multiplier: f64, max_delay: Duration },
}

/// Configuration for one protected command
///
/// Bound to the command state when the command is first registered;
/// reconfiguring an existing command requires a new state.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandConfig {
    /// Maximum call latency before the invocation is timed out
    pub timeout: Duration,

    /// Minimum number of outcomes in the window before the breaker can open
    pub request_volume_threshold: usize,

    /// Fraction (0.0-1.0) of failing/timeout outcomes that trips the breaker
    pub failure_ratio_threshold: f64,

    /// Time the breaker stays open before allowing a half-open trial
    pub delay: Duration,

    /// Span of the rolling outcome window
    pub window: Duration,

    /// How the open delay evolves across consecutive open episodes
    pub backoff: Backoff,

    /// Jitter factor for the open delay (0.0 = none, 1.0 = full jitter)
    /// Uses chrono-machines formula: delay * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            request_volume_threshold: 20,
            failure_ratio_threshold: 0.5,
            delay: Duration::from_secs(5),
            window: Duration::from_secs(60),
            backoff: Backoff::Fixed,
            jitter_factor: 0.0,
        }
    }
}

impl CommandConfig {
    /// Validate the configuration at registration time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_ratio_threshold) {
            return Err(ConfigError::InvalidFailureRatio(
                self.failure_ratio_threshold,
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NonPositiveTimeout);
        }
        if self.request_volume_threshold == 0 {
            return Err(ConfigError::ZeroRequestVolume);
        }
        if self.delay.is_zero() {
            return Err(ConfigError::NonPositiveDelay);
        }
        if self.window.is_zero() {
            return Err(ConfigError::NonPositiveWindow);
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.jitter_factor));
        }
        if let Backoff::Exponential { multiplier, max_delay } = self.backoff
            && (multiplier < 1.0 || max_delay < self.delay)
        {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommandConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.request_volume_threshold, 20);
        assert_eq!(config.failure_ratio_threshold, 0.5);
        assert_eq!(config.delay, Duration::from_secs(5));
        assert_eq!(config.backoff, Backoff::Fixed);
    }

    #[test]
    fn test_ratio_outside_unit_interval_rejected() {
        let config = CommandConfig {
            failure_ratio_threshold: 1.5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidFailureRatio(1.5))
        );

        let config = CommandConfig {
            failure_ratio_threshold: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CommandConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveTimeout));
    }

    #[test]
    fn test_zero_volume_rejected() {
        let config = CommandConfig {
            request_volume_threshold: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroRequestVolume));
    }

    #[test]
    fn test_zero_delay_and_window_rejected() {
        let config = CommandConfig {
            delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveDelay));

        let config = CommandConfig {
            window: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveWindow));
    }

    #[test]
    fn test_exponential_backoff_bounds() {
        let config = CommandConfig {
            backoff: Backoff::Exponential {
                multiplier: 0.5,
                max_delay: Duration::from_secs(60),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CommandConfig {
            delay: Duration::from_secs(5),
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CommandConfig {
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
