//! Builder API for ergonomic invoker configuration

use crate::{
    MetricsRegistry,
    callbacks::Callbacks,
    classifier::FailureClassifier,
    invoker::Invoker,
    storage::{MemoryStore, OutcomeStore},
};
use std::sync::Arc;

/// Builder for creating invokers with a fluent API
pub struct InvokerBuilder {
    store: Option<Arc<dyn OutcomeStore>>,
    metrics: Option<Arc<MetricsRegistry>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl InvokerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            store: None,
            metrics: None,
            classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Set a custom outcome store
    pub fn store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing metrics registry
    ///
    /// Useful when one process-wide registry backs several invokers or
    /// when callers register their own gauges next to command metrics.
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set a classifier deciding which execution errors feed breaker
    /// statistics
    ///
    /// # Examples
    ///
    /// ```rust
    /// use command_machines::{Invoker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let invoker = Invoker::builder()
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only slow errors count
    ///         ctx.duration > 1.0
    ///     })))
    ///     .build();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Set callback for when a breaker opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when a breaker closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a breaker enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Set callback for rejected admissions
    pub fn on_reject<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_reject = Some(Arc::new(f));
        self
    }

    /// Build the invoker
    pub fn build(self) -> Invoker {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsRegistry::new()));

        Invoker::with_parts(store, metrics, self.classifier, self.callbacks)
    }
}

impl Default for InvokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
