// Blocking primitives used by the test protocol
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Interruptible waits.
//!
//! Both the access gate and the completion can be abandoned by raising the
//! [`CancelToken`] handed to the wait. Waiters re-check the token every
//! `CANCEL_POLL`, so cancellation is observed within that delay.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use thiserror::Error as ThisError;

const CANCEL_POLL: Duration = Duration::from_millis(10);

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
pub(crate) enum Error {
    #[error("Wait interrupted")]
    Interrupted,
}

/// Shared cancellation flag, the user space stand-in for a pending signal.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Binary semaphore guarding a critical section.
#[derive(Debug)]
pub(crate) struct AccessGate {
    permits: Mutex<usize>,
    released: Condvar,
}

/// Held permit of an [`AccessGate`], returned on drop.
#[derive(Debug)]
#[must_use]
pub(crate) struct GateGuard<'a> {
    gate: &'a AccessGate,
}

impl AccessGate {
    pub(crate) fn new() -> Self {
        AccessGate {
            permits: Mutex::new(1),
            released: Condvar::new(),
        }
    }

    /// Blocks until the permit is obtained. A free permit is always taken,
    /// cancellation only aborts an actual wait.
    pub(crate) fn down_interruptible(&self, cancel: &CancelToken) -> Result<GateGuard<'_>> {
        let mut permits = self.permits.lock().unwrap();

        loop {
            if *permits > 0 {
                *permits -= 1;
                return Ok(GateGuard { gate: self });
            }

            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }

            permits = self.released.wait_timeout(permits, CANCEL_POLL).unwrap().0;
        }
    }

    fn up(&self) {
        *self.permits.lock().unwrap() += 1;
        self.released.notify_one();
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.up();
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum WaitOutcome {
    /// Signaled, with the instant `complete()` was called.
    Completed(Instant),
    TimedOut,
    Interrupted,
}

/// One-shot wait token.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: Mutex<Option<Instant>>,
    signaled: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Signals the waiter. Only the first call is recorded.
    pub(crate) fn complete(&self) {
        let mut done = self.done.lock().unwrap();
        if done.is_none() {
            *done = Some(Instant::now());
        }

        self.signaled.notify_all();
    }

    pub(crate) fn wait_interruptible_timeout(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();

        loop {
            if let Some(at) = *done {
                return WaitOutcome::Completed(at);
            }

            if cancel.is_cancelled() {
                return WaitOutcome::Interrupted;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }

            let slice = (deadline - now).min(CANCEL_POLL);
            done = self.signaled.wait_timeout(done, slice).unwrap().0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread::{sleep, spawn},
    };

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_gate_serializes_holders() {
        let gate = Arc::new(AccessGate::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let gate = gate.clone();
            let active = active.clone();

            handles.push(spawn(move || {
                for _ in 0..10 {
                    let _guard = gate.down_interruptible(&CancelToken::new()).unwrap();
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_gate_interrupted_wait() {
        let gate = AccessGate::new();
        let cancel = CancelToken::new();

        let guard = gate.down_interruptible(&cancel).unwrap();
        cancel.cancel();
        assert_matches!(gate.down_interruptible(&cancel), Err(Error::Interrupted));

        // Released permit is still taken with a cancelled token.
        drop(guard);
        assert_matches!(gate.down_interruptible(&cancel), Ok(_));
    }

    #[test]
    fn test_gate_cancel_while_blocked() {
        let gate = Arc::new(AccessGate::new());
        let cancel = CancelToken::new();
        let _guard = gate.down_interruptible(&cancel).unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            spawn(move || gate.down_interruptible(&cancel).map(|_| ()))
        };

        sleep(Duration::from_millis(50));
        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
    }

    #[test]
    fn test_completion_outcomes() {
        let cancel = CancelToken::new();

        // Nobody signals
        let done = Completion::new();
        let start = Instant::now();
        assert_eq!(
            done.wait_interruptible_timeout(Duration::from_millis(100), &cancel),
            WaitOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(100));

        // Signaled from another thread
        let done = Arc::new(Completion::new());
        let signaler = {
            let done = done.clone();
            spawn(move || {
                sleep(Duration::from_millis(20));
                done.complete();
            })
        };
        assert_matches!(
            done.wait_interruptible_timeout(Duration::from_secs(5), &cancel),
            WaitOutcome::Completed(_)
        );
        signaler.join().unwrap();

        // Cancelled waiter
        let done = Completion::new();
        cancel.cancel();
        assert_eq!(
            done.wait_interruptible_timeout(Duration::from_secs(5), &cancel),
            WaitOutcome::Interrupted
        );
    }

    #[test]
    fn test_completion_keeps_first_signal() {
        let done = Completion::new();
        done.complete();
        let first = done.wait_interruptible_timeout(Duration::ZERO, &CancelToken::new());

        sleep(Duration::from_millis(5));
        done.complete();
        assert_eq!(
            done.wait_interruptible_timeout(Duration::ZERO, &CancelToken::new()),
            first
        );
    }
}
