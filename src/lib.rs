//! CommandMachines - fault-tolerant command execution
//!
//! This crate wraps arbitrary units of work with:
//! - Timeout enforcement on a dedicated thread with advisory cancellation
//! - A per-command circuit breaker (Closed → Open → HalfOpen) fed by a
//!   rolling outcome window
//! - Thread-safe timers, meters and pull-evaluated gauges with a
//!   poll-friendly snapshot
//!
//! Commands are identified by an opaque command key and grouped under a
//! group key used only for aggregate reporting.
//!
//! # Example
//!
//! ```rust
//! use command_machines::{CommandConfig, Invoker};
//! use std::time::Duration;
//!
//! let invoker = Invoker::builder()
//!     .on_open(|command| println!("breaker for '{}' opened", command))
//!     .build();
//!
//! let config = CommandConfig {
//!     timeout: Duration::from_millis(500),
//!     request_volume_threshold: 4,
//!     failure_ratio_threshold: 0.5,
//!     delay: Duration::from_secs(5),
//!     ..CommandConfig::default()
//! };
//!
//! let result = invoker.execute("add-customer", "customers", config, || {
//!     // Your service call here
//!     Ok::<_, String>("stored")
//! });
//! assert_eq!(result.unwrap(), "stored");
//!
//! // Pull-based export for a metrics endpoint
//! let snapshot = invoker.metrics().snapshot();
//! assert_eq!(snapshot["command.add-customer.calls.count"], 1.0);
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod invoker;
pub mod metrics;
pub mod storage;
pub mod timeout;

pub use builder::InvokerBuilder;
pub use circuit::{Admission, CircuitBreaker};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use config::{Backoff, CommandConfig};
pub use errors::{CommandError, ConfigError};
pub use invoker::{CallOptions, Cancellable, FallbackContext, Invoker};
pub use metrics::MetricsRegistry;
pub use storage::{MemoryStore, NullStore, OutcomeStore};
pub use timeout::{BoundedCall, CancelToken, run_bounded};

/// How a protected invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
    Rejected,
}

/// A single outcome recorded for a command
#[derive(Debug, Clone)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub timestamp: f64,
    pub duration: f64,
}
