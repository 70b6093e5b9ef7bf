//! Wake-up primitives shared between the engine and its consumers.
//!
//! [`NewData`] counts completed cycles; waiters remember the generation they
//! saw last, so several consumers can wait without clearing each other's
//! signal. [`CancelToken`] is a settable flag that can be waited on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// ─── NewData ────────────────────────────────────────────────────────

/// "New data available" signal with a generation counter.
#[derive(Debug, Default)]
pub struct NewData {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl NewData {
    /// Signal without waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Publish a new generation and wake all waiters.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Wait until the generation differs from `seen`.
    ///
    /// Returns the new generation, or `None` after `timeout`.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return (*generation != seen).then_some(*generation);
            }
        }
        Some(*generation)
    }
}

// ─── CancelToken ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Cooperative cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// Token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all waiters.
    pub fn cancel(&self) {
        *self.state.cancelled.lock() = true;
        self.state.cond.notify_all();
    }

    /// Clear the flag for reuse.
    pub fn reset(&self) {
        *self.state.cancelled.lock() = false;
    }

    /// True once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }

    /// Sleep up to `timeout`, returns early with `true` when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.state.cancelled.lock();
        while !*cancelled {
            if self.state.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_newer_times_out_without_signal() {
        let signal = NewData::new();
        let seen = signal.generation();
        assert_eq!(signal.wait_newer(seen, Duration::from_millis(10)), None);
    }

    #[test]
    fn wait_newer_returns_immediately_on_missed_signal() {
        let signal = NewData::new();
        let seen = signal.generation();
        signal.notify();
        assert_eq!(signal.wait_newer(seen, Duration::from_secs(1)), Some(seen + 1));
    }

    #[test]
    fn notify_wakes_other_thread() {
        let signal = Arc::new(NewData::new());
        let seen = signal.generation();
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_newer(seen, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap().is_some());
    }

    #[test]
    fn cancel_token_wakes_and_resets() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));

        let remote = token.clone();
        let waiter = thread::spawn(move || remote.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(waiter.join().unwrap());

        token.reset();
        assert!(!token.is_cancelled());
    }
}
