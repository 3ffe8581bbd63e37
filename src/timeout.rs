//! Deadline enforcement for a single unit of work
//!
//! The guard runs the work on a dedicated thread and races it against
//! the deadline. The caller is unblocked at the deadline regardless of
//! whether the work cooperates; a late result is dropped and cannot
//! reach shared state the caller observes through this call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Advisory cancellation flag handed to the unit of work
///
/// Set when the deadline fires. Cooperative work can poll it and stop
/// early; work that ignores it is abandoned, not halted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Result of a deadline-bounded invocation
#[derive(Debug)]
pub enum BoundedCall<T, E> {
    /// The work finished before the deadline
    Completed { result: Result<T, E>, elapsed: Duration },
    /// The deadline fired first; the work was signalled and abandoned
    TimedOut { elapsed: Duration },
}

/// Run `work` with a deadline
///
/// Returns within the deadline (plus scheduling latency) for arbitrarily
/// slow work. A unit of work that completes after the deadline has its
/// result discarded; for breaker and metrics purposes the invocation
/// stays a timeout. A panicking unit of work resumes its panic here.
pub fn run_bounded<T, E, F>(work: F, deadline: Duration) -> BoundedCall<T, E>
where
    F: FnOnce(CancelToken) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let token = CancelToken::new();
    let worker_token = token.clone();
    let (tx, rx) = mpsc::sync_channel(1);
    let start = Instant::now();

    let handle = thread::spawn(move || {
        let result = work(worker_token);
        // The receiver is gone once the deadline fired; a late result
        // is dropped here.
        let _ = tx.send(result);
    });

    match rx.recv_timeout(deadline) {
        Ok(result) => BoundedCall::Completed {
            result,
            elapsed: start.elapsed(),
        },
        Err(RecvTimeoutError::Timeout) => {
            token.cancel();
            drop(rx);
            BoundedCall::TimedOut {
                elapsed: start.elapsed(),
            }
        }
        Err(RecvTimeoutError::Disconnected) => match handle.join() {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(()) => unreachable!("worker exited without sending a result"),
        },
    }
}
