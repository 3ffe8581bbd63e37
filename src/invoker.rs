//! Protected command execution
//!
//! The invoker composes admission control, deadline enforcement and
//! metrics recording around a caller-supplied unit of work, keyed by
//! (command, group). Command state is created lazily on first use and
//! lives for the process lifetime.

use crate::{
    OutcomeKind,
    callbacks::Callbacks,
    circuit::{Admission, CircuitBreaker},
    classifier::{FailureClassifier, FailureContext},
    config::CommandConfig,
    errors::{CommandError, ConfigError},
    metrics::MetricsRegistry,
    storage::OutcomeStore,
    timeout::{BoundedCall, CancelToken, run_bounded},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Context provided to fallback closures when admission is rejected
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Command key
    pub command: String,
    /// Timestamp when the breaker opened
    pub opened_at: f64,
    /// Breaker state at rejection time
    pub state: &'static str,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Options for protected calls
pub struct CallOptions<T, E> {
    /// Optional fallback invoked when admission is rejected
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Opt-in wrapper for cancellation-aware units of work
///
/// The wrapped closure receives the deadline's [`CancelToken`] and can
/// stop early once it is set.
pub struct Cancellable<F>(pub F);

/// Type alias for the boxed unit of work
pub type ProtectedFn<T, E> = Box<dyn FnOnce(CancelToken) -> Result<T, E> + Send>;

/// Trait for converting into a protected call - allows a flexible
/// `execute()` API
pub trait IntoProtectedCall<T, E> {
    fn into_protected_call(self) -> (ProtectedFn<T, E>, CallOptions<T, E>);
}

/// Implement for plain closures
impl<T, E, F> IntoProtectedCall<T, E> for F
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    fn into_protected_call(self) -> (ProtectedFn<T, E>, CallOptions<T, E>) {
        (Box::new(move |_token| self()), CallOptions::default())
    }
}

/// Implement for (closure, CallOptions) pairs
impl<T, E, F> IntoProtectedCall<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    fn into_protected_call(self) -> (ProtectedFn<T, E>, CallOptions<T, E>) {
        (Box::new(move |_token| (self.0)()), self.1)
    }
}

/// Implement for cancellation-aware closures
impl<T, E, F> IntoProtectedCall<T, E> for Cancellable<F>
where
    F: FnOnce(CancelToken) -> Result<T, E> + Send + 'static,
{
    fn into_protected_call(self) -> (ProtectedFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0), CallOptions::default())
    }
}

/// Implement for (cancellation-aware closure, CallOptions) pairs
impl<T, E, F> IntoProtectedCall<T, E> for (Cancellable<F>, CallOptions<T, E>)
where
    F: FnOnce(CancelToken) -> Result<T, E> + Send + 'static,
{
    fn into_protected_call(self) -> (ProtectedFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0.0), self.1)
    }
}

/// State for one registered command
struct CommandEntry {
    command: String,
    group: String,
    config: CommandConfig,
    breaker: Mutex<CircuitBreaker>,
}

/// Facade composing breaker admission, deadline enforcement and metrics
/// around protected commands
pub struct Invoker {
    entries: RwLock<HashMap<String, Arc<CommandEntry>>>,
    store: Arc<dyn OutcomeStore>,
    metrics: Arc<MetricsRegistry>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl Invoker {
    /// Create an invoker with in-memory storage and a fresh registry
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new invoker builder
    pub fn builder() -> crate::builder::InvokerBuilder {
        crate::builder::InvokerBuilder::new()
    }

    pub(crate) fn with_parts(
        store: Arc<dyn OutcomeStore>,
        metrics: Arc<MetricsRegistry>,
        classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            metrics,
            classifier,
            callbacks,
        }
    }

    /// The registry commands record into; poll `snapshot()` for export
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Validate and create the command state up front
    ///
    /// `execute` registers on first use with the same semantics; use this
    /// when configuration errors should surface at startup.
    pub fn register(
        &self,
        command: &str,
        group: &str,
        config: CommandConfig,
    ) -> Result<(), ConfigError> {
        self.entry_for(command, group, &config).map(|_| ())
    }

    /// Breaker state for a registered command
    pub fn state_of(&self, command: &str) -> Option<&'static str> {
        let entries = self.entries.read().unwrap();
        entries
            .get(command)
            .map(|entry| entry.breaker.lock().unwrap().state_name())
    }

    /// Execute a unit of work under timeout and breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `invoker.execute(cmd, grp, config, || api_request())`
    /// - A closure with options: `invoker.execute(cmd, grp, config, (|| api_request(), CallOptions::new().with_fallback(...)))`
    /// - A cancellation-aware closure wrapped in [`Cancellable`]
    ///
    /// The configuration binds on the call that first registers the
    /// command; later calls for the same command ignore it.
    pub fn execute<I, T, E>(
        &self,
        command: &str,
        group: &str,
        config: CommandConfig,
        input: I,
    ) -> Result<T, CommandError<E>>
    where
        I: IntoProtectedCall<T, E>,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (work, options) = input.into_protected_call();
        let entry = self
            .entry_for(command, group, &config)
            .map_err(CommandError::Config)?;

        let admission = {
            let mut breaker = entry.breaker.lock().unwrap();
            breaker.admit(&self.callbacks)
        };

        let trial = match admission {
            Admission::Rejected { opened_at, state } => {
                self.store.record(&entry.command, OutcomeKind::Rejected, 0.0);
                self.metrics
                    .increment_meter(&format!("command.{}.circuit-open", entry.command));
                self.callbacks.trigger_reject(&entry.command);
                tracing::debug!(
                    command = %entry.command,
                    state,
                    "admission rejected, failing fast"
                );

                if let Some(fallback) = options.fallback {
                    let ctx = FallbackContext {
                        command: entry.command.clone(),
                        opened_at,
                        state,
                    };
                    return fallback(&ctx).map_err(CommandError::Execution);
                }

                return Err(CommandError::CircuitOpen {
                    command: entry.command.clone(),
                    opened_at,
                });
            }
            Admission::Allowed { trial } => trial,
        };

        self.metrics
            .increment_meter(&format!("command.{}.calls", entry.command));
        self.metrics
            .increment_meter(&format!("group.{}.calls", entry.group));

        match run_bounded(work, entry.config.timeout) {
            BoundedCall::TimedOut { elapsed } => {
                {
                    let mut breaker = entry.breaker.lock().unwrap();
                    breaker.on_outcome(
                        OutcomeKind::Timeout,
                        elapsed.as_secs_f64(),
                        trial,
                        &self.callbacks,
                    );
                }
                self.metrics
                    .record_timer(&format!("command.{}.latency", entry.command), elapsed);
                tracing::debug!(command = %entry.command, ?elapsed, "command timed out");

                Err(CommandError::Timeout {
                    command: entry.command.clone(),
                    elapsed,
                })
            }
            BoundedCall::Completed { result, elapsed } => {
                let duration = elapsed.as_secs_f64();
                let outcome = match &result {
                    Ok(_) => OutcomeKind::Success,
                    Err(error) => {
                        let counts = self
                            .classifier
                            .as_ref()
                            .map(|classifier| {
                                classifier.counts_as_failure(&FailureContext {
                                    command: &entry.command,
                                    error,
                                    duration,
                                })
                            })
                            .unwrap_or(true);
                        if counts {
                            OutcomeKind::Failure
                        } else {
                            // The dependency answered; the error is the
                            // caller's business, not the breaker's
                            OutcomeKind::Success
                        }
                    }
                };

                {
                    let mut breaker = entry.breaker.lock().unwrap();
                    breaker.on_outcome(outcome, duration, trial, &self.callbacks);
                }
                self.metrics
                    .record_timer(&format!("command.{}.latency", entry.command), elapsed);

                result.map_err(CommandError::Execution)
            }
        }
    }

    /// Fetch-or-create the command state; the first writer wins
    fn entry_for(
        &self,
        command: &str,
        group: &str,
        config: &CommandConfig,
    ) -> Result<Arc<CommandEntry>, ConfigError> {
        if let Some(entry) = self.entries.read().unwrap().get(command) {
            return Ok(entry.clone());
        }

        config.validate()?;

        let created = {
            let mut entries = self.entries.write().unwrap();
            // A concurrent creator may have won the race
            if let Some(entry) = entries.get(command) {
                return Ok(entry.clone());
            }

            let entry = Arc::new(CommandEntry {
                command: command.to_string(),
                group: group.to_string(),
                config: config.clone(),
                breaker: Mutex::new(CircuitBreaker::new(
                    command,
                    config.clone(),
                    self.store.clone(),
                )),
            });
            entries.insert(command.to_string(), entry.clone());
            entry
        };

        // Bind the state gauge outside the entries lock
        let gauge_entry = created.clone();
        self.metrics.register_gauge(
            format!("command.{}.breaker-open", command),
            move || {
                if gauge_entry.breaker.lock().unwrap().is_open() {
                    1.0
                } else {
                    0.0
                }
            },
        );
        tracing::debug!(command, group, "command registered");

        Ok(created)
    }
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap();
        f.debug_struct("Invoker")
            .field("commands", &entries.len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PredicateClassifier;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn quick_config() -> CommandConfig {
        CommandConfig {
            timeout: Duration::from_millis(200),
            request_volume_threshold: 2,
            failure_ratio_threshold: 0.5,
            delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_success_passes_value_through() {
        let invoker = Invoker::new();

        let result = invoker.execute("add-customer", "customers", quick_config(), || {
            Ok::<_, String>(42)
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(invoker.state_of("add-customer"), Some("Closed"));
    }

    #[test]
    fn test_execution_error_wraps_original() {
        let invoker = Invoker::new();

        let result: Result<(), _> =
            invoker.execute("add-customer", "customers", quick_config(), || {
                Err("store rejected the row".to_string())
            });

        match result {
            Err(CommandError::Execution(e)) => assert_eq!(e, "store rejected the row"),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_breaker_opens_and_rejected_call_never_runs() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        let result = invoker.execute("add-customer", "customers", config, move || {
            invoked_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });

        match result {
            Err(CommandError::CircuitOpen { command, .. }) => {
                assert_eq!(command, "add-customer");
            }
            other => panic!("expected circuit-open error, got {:?}", other),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_is_a_distinguishable_kind() {
        let invoker = Invoker::new();
        let config = CommandConfig {
            timeout: Duration::from_millis(30),
            ..quick_config()
        };

        let started = std::time::Instant::now();
        let result = invoker.execute("slow-report", "reports", config, || {
            thread::sleep(Duration::from_secs(3));
            Ok::<_, String>(())
        });

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_config_error_only_on_registering_call() {
        let invoker = Invoker::new();
        let bad = CommandConfig {
            failure_ratio_threshold: 2.0,
            ..Default::default()
        };

        let result = invoker.execute("add-customer", "customers", bad.clone(), || {
            Ok::<_, String>(())
        });
        assert!(matches!(
            result,
            Err(CommandError::Config(ConfigError::InvalidFailureRatio(_)))
        ));

        // Once registered with a valid config, a bad config on a later
        // call is ignored rather than re-validated
        invoker
            .register("add-customer", "customers", quick_config())
            .unwrap();
        let result = invoker.execute("add-customer", "customers", bad, || {
            Ok::<_, String>(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_first_registration_wins() {
        let invoker = Invoker::new();

        invoker
            .register("add-customer", "customers", quick_config())
            .unwrap();

        // A competing config with a huge volume threshold is ignored
        let loose = CommandConfig {
            request_volume_threshold: 1000,
            ..quick_config()
        };
        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", loose.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }

        assert_eq!(invoker.state_of("add-customer"), Some("Open"));
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial_under_contention() {
        let invoker = Arc::new(Invoker::new());
        // Roomy timeout: the probe must finish as a success, not a timeout
        let config = CommandConfig {
            timeout: Duration::from_secs(2),
            ..quick_config()
        };

        for _ in 0..2 {
            let _ = invoker.execute("probe", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        assert_eq!(invoker.state_of("probe"), Some("Open"));
        thread::sleep(Duration::from_millis(70));

        let threads = 20;
        let invoked = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(threads));
        let mut handles = vec![];

        for _ in 0..threads {
            let invoker = invoker.clone();
            let invoked = invoked.clone();
            let barrier = barrier.clone();
            let config = config.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let result = invoker.execute("probe", "customers", config, move || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    // Long enough that every contender sees the probe in flight
                    thread::sleep(Duration::from_millis(250));
                    Ok::<_, String>(())
                });
                result.is_ok()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|res| matches!(res, Ok(true)))
            .count();

        assert_eq!(
            invoked.load(Ordering::SeqCst),
            1,
            "exactly one probe may run"
        );
        assert_eq!(successes, 1);
        // The successful trial closed the breaker
        assert_eq!(invoker.state_of("probe"), Some("Closed"));
    }

    #[test]
    fn test_successful_trial_recovers_the_command() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));

        thread::sleep(Duration::from_millis(70));
        let result = invoker.execute("add-customer", "customers", config.clone(), || {
            Ok::<_, String>(())
        });
        assert!(result.is_ok());
        assert_eq!(invoker.state_of("add-customer"), Some("Closed"));

        // The window restarted: a single failure does not reopen
        let _ = invoker.execute("add-customer", "customers", config, || {
            Err::<(), _>("boom".to_string())
        });
        assert_eq!(invoker.state_of("add-customer"), Some("Closed"));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        thread::sleep(Duration::from_millis(70));

        let result = invoker.execute("add-customer", "customers", config, || {
            Err::<(), _>("still broken".to_string())
        });
        assert!(matches!(result, Err(CommandError::Execution(_))));
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));
    }

    #[test]
    fn test_fallback_answers_while_open() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));

        let result = invoker.execute(
            "add-customer",
            "customers",
            config,
            (
                || Err::<String, _>("should not execute".to_string()),
                CallOptions::new().with_fallback(|ctx| {
                    assert_eq!(ctx.command, "add-customer");
                    assert_eq!(ctx.state, "Open");
                    Ok("cached response".to_string())
                }),
            ),
        );

        assert_eq!(result.unwrap(), "cached response");
    }

    #[test]
    fn test_fallback_error_propagates_as_execution() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }

        let result = invoker.execute(
            "add-customer",
            "customers",
            config,
            (
                || Ok::<(), _>(()),
                CallOptions::<(), String>::new()
                    .with_fallback(|_ctx| Err("fallback failed".to_string())),
            ),
        );

        match result {
            Err(CommandError::Execution(e)) => assert_eq!(e, "fallback failed"),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_cancellable_work_observes_the_deadline() {
        let invoker = Invoker::new();
        let config = CommandConfig {
            timeout: Duration::from_millis(40),
            ..quick_config()
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let result = invoker.execute(
            "slow-report",
            "reports",
            config,
            Cancellable(move |token: CancelToken| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                tx.send(()).unwrap();
                Ok::<_, String>(())
            }),
        );

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        rx.recv_timeout(Duration::from_secs(2))
            .expect("work should observe cancellation");
    }

    #[test]
    fn test_uncounted_errors_do_not_trip_the_breaker() {
        let invoker = Invoker::builder()
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error
                    .downcast_ref::<String>()
                    .map(|e| e.contains("server"))
                    .unwrap_or(true)
            })))
            .build();
        let config = quick_config();

        // Client errors are the caller's business
        for _ in 0..4 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("client error".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Closed"));

        // Server errors count; 4 successes + 4 failures = 0.5 ratio
        for _ in 0..4 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("server error".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));
    }

    #[test]
    fn test_metrics_recorded_under_derived_names() {
        let invoker = Invoker::new();
        // [success, failure] alone must not trip: volume 3, ratio 0.6
        let config = CommandConfig {
            request_volume_threshold: 3,
            failure_ratio_threshold: 0.6,
            ..quick_config()
        };

        let _ = invoker.execute("add-customer", "customers", config.clone(), || {
            Ok::<_, String>(())
        });
        let _ = invoker.execute("delete-customer", "customers", config.clone(), || {
            Ok::<_, String>(())
        });

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        // Rejected while open
        let _ = invoker.execute("add-customer", "customers", config, || {
            Ok::<_, String>(())
        });

        let snapshot = invoker.metrics().snapshot();
        assert_eq!(snapshot["command.add-customer.calls.count"], 3.0);
        assert_eq!(snapshot["command.add-customer.latency.count"], 3.0);
        assert_eq!(snapshot["command.add-customer.circuit-open.count"], 1.0);
        assert_eq!(snapshot["command.add-customer.breaker-open"], 1.0);
        assert_eq!(snapshot["command.delete-customer.calls.count"], 1.0);
        // Group meters aggregate across commands
        assert_eq!(snapshot["group.customers.calls.count"], 4.0);
    }

    #[test]
    fn test_reject_callback_fires() {
        let rejections = Arc::new(AtomicUsize::new(0));
        let rejections_clone = rejections.clone();
        let invoker = Invoker::builder()
            .on_reject(move |_command| {
                rejections_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        let _ = invoker.execute("add-customer", "customers", config, || {
            Ok::<_, String>(())
        });

        assert_eq!(rejections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commands_are_isolated() {
        let invoker = Invoker::new();
        let config = quick_config();

        for _ in 0..2 {
            let _ = invoker.execute("add-customer", "customers", config.clone(), || {
                Err::<(), _>("boom".to_string())
            });
        }
        assert_eq!(invoker.state_of("add-customer"), Some("Open"));

        // A sibling command in the same group is unaffected
        let result = invoker.execute("delete-customer", "customers", config, || {
            Ok::<_, String>(())
        });
        assert!(result.is_ok());
        assert_eq!(invoker.state_of("delete-customer"), Some("Closed"));
    }
}
