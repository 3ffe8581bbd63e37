//! Failure classification for execution errors
//!
//! Decides which execution errors count toward breaker statistics.
//! Errors the classifier declines to count are recorded as successful
//! outcomes: the dependency answered, even if it answered with an error
//! the caller considers expected (validation failures, 4xx responses).
//! Timeouts always count and never reach the classifier.

use std::any::Any;

/// Context provided to classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Command key
    pub command: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call in seconds
    pub duration: f64,
}

/// Trait deciding whether an execution error feeds breaker statistics
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should count as a failing outcome
    fn counts_as_failure(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier: every execution error counts
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn counts_as_failure(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    /// Create a new predicate-based classifier
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn counts_as_failure(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
