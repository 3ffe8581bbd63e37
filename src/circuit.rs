//! Circuit breaker state machine for one protected command
//!
//! Admission decisions and outcome-driven transitions for a single
//! command key. Transitions are serialized by the owning entry's lock.

use crate::{
    OutcomeKind,
    callbacks::Callbacks,
    config::{Backoff, CommandConfig},
    storage::OutcomeStore,
};
use state_machines::state_machine;
use std::sync::Arc;

/// Breaker context - shared data across all states
#[derive(Clone)]
pub struct BreakerContext {
    pub command: String,
    pub config: CommandConfig,
    pub store: Arc<dyn OutcomeStore>,
}

impl Default for BreakerContext {
    fn default() -> Self {
        Self {
            command: String::new(),
            config: CommandConfig::default(),
            store: Arc::new(crate::MemoryStore::new()),
        }
    }
}

impl std::fmt::Debug for BreakerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerContext")
            .field("command", &self.command)
            .field("config", &self.config)
            .field("store", &"<dyn OutcomeStore>")
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
    /// Open episodes without an intervening close; drives backoff
    pub consecutive_opens: u32,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// At most one probe may be in flight per half-open episode
    pub probe_in_flight: bool,
    /// Open timestamp of the episode that preceded this probe
    pub opened_at: f64,
    pub prior_opens: u32,
}

// Define the breaker state machine with dynamic mode
state_machine! {
    name: Breaker,
    context: BreakerContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [delay_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

// Guards for dynamic mode - implemented on typestate machines
impl Breaker<Closed> {
    /// Open once the window holds enough outcomes and the failure ratio
    /// meets the configured threshold
    fn should_open(&self, ctx: &BreakerContext) -> bool {
        let window = ctx.config.window.as_secs_f64();
        let failures = ctx.store.failure_count(&ctx.command, window);
        let total = failures + ctx.store.success_count(&ctx.command, window);

        if total < ctx.config.request_volume_threshold {
            return false;
        }

        let ratio = failures as f64 / total as f64;
        ratio >= ctx.config.failure_ratio_threshold
    }
}

impl Breaker<HalfOpen> {
    /// A failed or timed-out trial always reopens the breaker
    fn should_open(&self, _ctx: &BreakerContext) -> bool {
        true
    }

    /// Driven only after the single trial succeeded
    fn should_close(&self, _ctx: &BreakerContext) -> bool {
        let data = self
            .state_data_half_open()
            .expect("HalfOpen state must have data");
        data.probe_in_flight
    }
}

impl Breaker<Open> {
    /// Check whether the reopen delay has elapsed for Open -> HalfOpen
    fn delay_elapsed(&self, ctx: &BreakerContext) -> bool {
        let data = self.open_data();
        let elapsed = ctx.store.monotonic_time() - data.opened_at;
        elapsed >= reopen_delay_secs(&ctx.config, data.consecutive_opens)
    }
}

/// Reopen delay in seconds for the given consecutive-open count
fn reopen_delay_secs(config: &CommandConfig, consecutive_opens: u32) -> f64 {
    let base = config.delay.as_secs_f64();
    let scaled = match config.backoff {
        Backoff::Fixed => base,
        Backoff::Exponential { multiplier, max_delay } => {
            let exponent = consecutive_opens.saturating_sub(1).min(32);
            (base * multiplier.powi(exponent as i32)).min(max_delay.as_secs_f64())
        }
    };

    // Apply jitter using chrono-machines if jitter_factor > 0
    if config.jitter_factor > 0.0 {
        let scaled_ms = (scaled * 1000.0) as u64;
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: scaled_ms,
            multiplier: 1.0,
            max_delay_ms: scaled_ms,
        };
        let delay_ms = policy.calculate_delay(1, config.jitter_factor);
        (delay_ms as f64) / 1000.0
    } else {
        scaled
    }
}

/// Admission decision for one invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The call may proceed; `trial` marks the single half-open probe
    Allowed { trial: bool },
    /// Fail fast without invoking the unit of work
    Rejected { opened_at: f64, state: &'static str },
}

/// Circuit breaker for one command key
pub struct CircuitBreaker {
    machine: DynamicBreaker,
    context: BreakerContext,
}

impl CircuitBreaker {
    pub fn new(
        command: impl Into<String>,
        config: CommandConfig,
        store: Arc<dyn OutcomeStore>,
    ) -> Self {
        let context = BreakerContext {
            command: command.into(),
            config,
            store,
        };
        let machine = DynamicBreaker::new(context.clone());

        Self { machine, context }
    }

    /// Decide whether a call may proceed
    ///
    /// Lazily performs the Open -> HalfOpen transition once the reopen
    /// delay has elapsed; the wall clock is consulted at most once per
    /// admission. While half-open, exactly one caller receives
    /// `Admission::Allowed { trial: true }`.
    pub fn admit(&mut self, callbacks: &Callbacks) -> Admission {
        if self.machine.current_state() == "Open" {
            let (opened_at, opens) = self
                .machine
                .open_data()
                .map(|d| (d.opened_at, d.consecutive_opens))
                .unwrap_or((0.0, 0));

            if self.machine.handle(BreakerEvent::AttemptReset).is_ok() {
                if let Some(data) = self.machine.half_open_data_mut() {
                    data.probe_in_flight = false;
                    data.opened_at = opened_at;
                    data.prior_opens = opens;
                }
                callbacks.trigger_half_open(&self.context.command);
                tracing::info!(
                    command = %self.context.command,
                    "breaker half-open, admitting a single trial"
                );
            }
        }

        match self.machine.current_state() {
            "Open" => {
                let opened_at = self.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0);
                Admission::Rejected {
                    opened_at,
                    state: "Open",
                }
            }
            "HalfOpen" => match self.machine.half_open_data_mut() {
                Some(data) if !data.probe_in_flight => {
                    data.probe_in_flight = true;
                    Admission::Allowed { trial: true }
                }
                data => Admission::Rejected {
                    opened_at: data.map(|d| d.opened_at).unwrap_or(0.0),
                    state: "HalfOpen",
                },
            },
            _ => Admission::Allowed { trial: false },
        }
    }

    /// Record a finished invocation and drive breaker transitions
    pub fn on_outcome(
        &mut self,
        kind: OutcomeKind,
        duration: f64,
        trial: bool,
        callbacks: &Callbacks,
    ) {
        self.context.store.record(&self.context.command, kind, duration);

        match kind {
            OutcomeKind::Success => {
                if trial
                    && self.machine.current_state() == "HalfOpen"
                    && self.machine.handle(BreakerEvent::Close).is_ok()
                {
                    // The window restarts from zero after recovery
                    self.context.store.clear(&self.context.command);
                    callbacks.trigger_close(&self.context.command);
                    tracing::info!(
                        command = %self.context.command,
                        "breaker closed after successful trial"
                    );
                }
            }
            OutcomeKind::Failure | OutcomeKind::Timeout => match self.machine.current_state() {
                "HalfOpen" if trial => {
                    let prior = self
                        .machine
                        .half_open_data()
                        .map(|d| d.prior_opens)
                        .unwrap_or(0);
                    if self.machine.handle(BreakerEvent::Trip).is_ok() {
                        self.mark_open(prior + 1, callbacks);
                    }
                }
                "Closed" => {
                    if self.machine.handle(BreakerEvent::Trip).is_ok() {
                        self.mark_open(1, callbacks);
                    }
                }
                _ => {}
            },
            OutcomeKind::Rejected => {}
        }
    }

    /// Check if the breaker is open
    pub fn is_open(&self) -> bool {
        self.machine.current_state() == "Open"
    }

    /// Check if the breaker is closed
    pub fn is_closed(&self) -> bool {
        self.machine.current_state() == "Closed"
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.current_state()
    }

    /// Clear the command's window and reset the breaker to Closed
    pub fn reset(&mut self) {
        self.context.store.clear(&self.context.command);
        // Recreate machine in Closed state
        self.machine = DynamicBreaker::new(self.context.clone());
    }

    /// Apply Open-state bookkeeping (timestamp + episode count + callback)
    fn mark_open(&mut self, consecutive_opens: u32, callbacks: &Callbacks) {
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = self.context.store.monotonic_time();
            data.consecutive_opens = consecutive_opens;
        }
        callbacks.trigger_open(&self.context.command);
        tracing::warn!(
            command = %self.context.command,
            consecutive_opens,
            "breaker opened"
        );
    }
}
