//! Error types for protected command execution

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Errors that can occur while executing a protected command
///
/// `CircuitOpen` and `Timeout` are synthesized by the core; `Execution`
/// wraps the unit of work's own error unchanged so callers can apply
/// different retry policies per kind.
#[derive(Debug)]
pub enum CommandError<E = Box<dyn Error + Send + Sync>> {
    /// Admission rejected; the unit of work was never attempted
    CircuitOpen { command: String, opened_at: f64 },
    /// Deadline exceeded; side effects of the work are of unknown status
    Timeout { command: String, elapsed: Duration },
    /// The wrapped unit of work failed
    Execution(E),
    /// Invalid configuration, surfaced by the call that registers the command
    Config(ConfigError),
}

impl<E> CommandError<E> {
    /// True for errors synthesized by the core before or instead of the work
    pub fn is_rejection(&self) -> bool {
        matches!(self, CommandError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

impl<E: fmt::Display> fmt::Display for CommandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::CircuitOpen { command, opened_at } => {
                write!(
                    f,
                    "Command '{}' rejected: breaker open (opened at {})",
                    command, opened_at
                )
            }
            CommandError::Timeout { command, elapsed } => {
                write!(
                    f,
                    "Command '{}' timed out after {:?}",
                    command, elapsed
                )
            }
            CommandError::Execution(e) => write!(f, "Command execution failed: {}", e),
            CommandError::Config(e) => write!(f, "Command configuration rejected: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for CommandError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommandError::Execution(e) => Some(e),
            CommandError::Config(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid command configuration, raised at registration time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    /// Failure ratio threshold outside [0, 1]
    InvalidFailureRatio(f64),
    /// Timeout must be positive
    NonPositiveTimeout,
    /// At least one outcome is required before the breaker can open
    ZeroRequestVolume,
    /// Open delay must be positive
    NonPositiveDelay,
    /// Rolling window span must be positive
    NonPositiveWindow,
    /// Jitter factor outside [0, 1]
    InvalidJitter(f64),
    /// Exponential backoff needs a multiplier >= 1 and a cap >= the base delay
    InvalidBackoff,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidFailureRatio(ratio) => {
                write!(f, "failure ratio threshold {} outside [0, 1]", ratio)
            }
            ConfigError::NonPositiveTimeout => write!(f, "timeout must be positive"),
            ConfigError::ZeroRequestVolume => {
                write!(f, "request volume threshold must be at least 1")
            }
            ConfigError::NonPositiveDelay => write!(f, "open delay must be positive"),
            ConfigError::NonPositiveWindow => write!(f, "rolling window span must be positive"),
            ConfigError::InvalidJitter(factor) => {
                write!(f, "jitter factor {} outside [0, 1]", factor)
            }
            ConfigError::InvalidBackoff => write!(
                f,
                "exponential backoff needs a multiplier >= 1 and a cap >= the base delay"
            ),
        }
    }
}

impl Error for ConfigError {}
