//! Outcome stores backing the per-command rolling window
//!
//! This module provides different store implementations:
//! - `MemoryStore`: Thread-safe in-memory store with sliding window
//! - `NullStore`: No-op store for testing and benchmarking

use crate::{Outcome, OutcomeKind};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Abstract store for command outcomes
pub trait OutcomeStore: Send + Sync + std::fmt::Debug {
    /// Record an outcome for a command
    fn record(&self, command: &str, kind: OutcomeKind, duration: f64);

    /// Count successful outcomes within a time window
    fn success_count(&self, command: &str, window_seconds: f64) -> usize;

    /// Count failing outcomes (failures and timeouts) within a time window
    fn failure_count(&self, command: &str, window_seconds: f64) -> usize;

    /// Count rejected admissions within a time window
    ///
    /// Rejections are reported for observability only and never feed
    /// breaker statistics.
    fn rejected_count(&self, command: &str, window_seconds: f64) -> usize;

    /// Clear all outcomes for a command
    fn clear(&self, command: &str);

    /// Clear all outcomes for all commands
    fn clear_all(&self);

    /// Get the outcome log for a command (limited to last N outcomes)
    fn outcome_log(&self, command: &str, limit: usize) -> Vec<Outcome>;

    /// Get monotonic time in seconds (relative to store creation)
    fn monotonic_time(&self) -> f64;
}

/// Thread-safe in-memory store for command outcomes
#[derive(Debug)]
pub struct MemoryStore {
    /// Outcomes keyed by command
    outcomes: RwLock<HashMap<String, Vec<Outcome>>>,
    /// Maximum outcomes to keep per command
    max_outcomes: usize,
    /// Monotonic time anchor (prevents clock skew issues from NTP)
    start_time: Instant,
}

impl MemoryStore {
    /// Create a new store instance
    pub fn new() -> Self {
        Self::with_max_outcomes(1000)
    }

    /// Create a store with a custom outcome bound per command
    pub fn with_max_outcomes(max_outcomes: usize) -> Self {
        Self {
            outcomes: RwLock::new(HashMap::new()),
            max_outcomes,
            start_time: Instant::now(),
        }
    }

    fn count_outcomes<P>(&self, command: &str, window_seconds: f64, predicate: P) -> usize
    where
        P: Fn(OutcomeKind) -> bool,
    {
        let outcomes = self.outcomes.read().unwrap();
        let cutoff = self.monotonic_time() - window_seconds;

        outcomes
            .get(command)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|o| predicate(o.kind) && o.timestamp >= cutoff)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeStore for MemoryStore {
    fn record(&self, command: &str, kind: OutcomeKind, duration: f64) {
        let mut outcomes = self.outcomes.write().unwrap();
        let entries = outcomes.entry(command.to_string()).or_default();

        entries.push(Outcome {
            kind,
            timestamp: self.start_time.elapsed().as_secs_f64(),
            duration,
        });

        // Cleanup old outcomes if we exceed max_outcomes
        if entries.len() > self.max_outcomes {
            // Remove oldest 10% to avoid cleanup on every outcome
            // Ensure we remove at least 1 even with small bounds
            let remove_count = (self.max_outcomes / 10).max(1);
            entries.drain(0..remove_count);
        }
    }

    fn success_count(&self, command: &str, window_seconds: f64) -> usize {
        self.count_outcomes(command, window_seconds, |k| k == OutcomeKind::Success)
    }

    fn failure_count(&self, command: &str, window_seconds: f64) -> usize {
        self.count_outcomes(command, window_seconds, |k| {
            matches!(k, OutcomeKind::Failure | OutcomeKind::Timeout)
        })
    }

    fn rejected_count(&self, command: &str, window_seconds: f64) -> usize {
        self.count_outcomes(command, window_seconds, |k| k == OutcomeKind::Rejected)
    }

    fn clear(&self, command: &str) {
        let mut outcomes = self.outcomes.write().unwrap();
        outcomes.remove(command);
    }

    fn clear_all(&self) {
        let mut outcomes = self.outcomes.write().unwrap();
        outcomes.clear();
    }

    fn outcome_log(&self, command: &str, limit: usize) -> Vec<Outcome> {
        let outcomes = self.outcomes.read().unwrap();
        outcomes
            .get(command)
            .map(|entries| {
                let start = entries.len().saturating_sub(limit);
                entries[start..].to_vec()
            })
            .unwrap_or_default()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// No-op store for testing and benchmarking
///
/// Discards all outcomes and always returns zero counts. Useful when
/// benchmarking pure admission logic or when an external system tracks
/// outcome history.
#[derive(Debug, Clone, Copy)]
pub struct NullStore {
    start_time: Instant,
}

impl NullStore {
    /// Create a new null store instance
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeStore for NullStore {
    fn record(&self, _command: &str, _kind: OutcomeKind, _duration: f64) {
        // No-op
    }

    fn success_count(&self, _command: &str, _window_seconds: f64) -> usize {
        0
    }

    fn failure_count(&self, _command: &str, _window_seconds: f64) -> usize {
        0
    }

    fn rejected_count(&self, _command: &str, _window_seconds: f64) -> usize {
        0
    }

    fn clear(&self, _command: &str) {
        // No-op
    }

    fn clear_all(&self) {
        // No-op
    }

    fn outcome_log(&self, _command: &str, _limit: usize) -> Vec<Outcome> {
        Vec::new()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}
