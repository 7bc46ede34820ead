//! One-shot deadline for a single in-flight call.
//!
//! A [`DeadlineGuard`] is armed with a duration and the call's
//! [`CancellationToken`]. If the deadline passes while the guard is still armed,
//! the token is cancelled and every future selecting on it aborts. Disarming
//! consumes the guard; dropping an armed guard disarms it, so a guard held on
//! the stack is released on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const DISARMED: u8 = 2;

/// Observable state of a [`DeadlineGuard`]. Both non-armed states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Timer pending.
    Armed,
    /// The deadline passed and the call was cancelled.
    Fired,
    /// Disarmed before the deadline.
    Disarmed,
}

/// Cancels one call's token if it outlives its deadline.
#[derive(Debug)]
pub struct DeadlineGuard {
    state: Arc<AtomicU8>,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineGuard {
    /// Arms a guard that cancels `token` after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn arm(timeout: Duration, token: CancellationToken) -> Self {
        let state = Arc::new(AtomicU8::new(ARMED));
        let timer = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if state
                    .compare_exchange(ARMED, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug!(timeout_ms = timeout.as_millis(), "deadline fired, cancelling call");
                    token.cancel();
                }
            })
        };
        Self {
            state,
            timer: Some(timer),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> GuardState {
        match self.state.load(Ordering::SeqCst) {
            ARMED => GuardState::Armed,
            FIRED => GuardState::Fired,
            _ => GuardState::Disarmed,
        }
    }

    /// Returns true if the deadline fired.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state() == GuardState::Fired
    }

    /// Disarms the guard and returns the state it ended in.
    ///
    /// After a fire this is a no-op that reports [`GuardState::Fired`].
    pub fn disarm(mut self) -> GuardState {
        self.release();
        self.state()
    }

    fn release(&mut self) {
        let _ = self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::SeqCst, Ordering::SeqCst);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.release();
    }
}
