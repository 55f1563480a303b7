//! Backoff and circuit-breaking arithmetic for the runtime loop.
//!
//! Generalized from the teacher's per-node `NodePolicy`/`CircuitBreakerState`
//! (which guards a single workflow node's retries) to a single breaker
//! guarding the whole planning/execution loop: repeated failed iterations
//! open the circuit and force the loop onto the maximum backoff until a
//! cooldown elapses or a plan succeeds.

use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Circuit-breaker state, mirroring the teacher's three-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Counts consecutive loop-iteration failures and opens after a threshold,
/// mirroring `workflow::policy::CircuitBreakerState`. `RwLock`-backed since
/// the runtime loop is single-task but the breaker may be inspected by an
/// external observer concurrently.
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    open_after: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(open_after: u32, reset_after: Duration) -> Self {
        CircuitBreaker {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            open_after,
            reset_after,
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;
        if self.open_after > 0 && inner.consecutive_failures >= self.open_after {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Current state, first collapsing `Open` to `HalfOpen` once the cooldown
    /// has elapsed (a probe attempt is then allowed through).
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.write().await;
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.reset_after {
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    pub async fn is_open(&self) -> bool {
        matches!(self.state().await, CircuitState::Open)
    }

    pub async fn force_close(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }
}

/// Backoff bounds: `min_wait <= backoff_for_attempt(n) <= max_wait`,
/// growing as `min_wait * 2^n`, capped to avoid overflow at large `n`
/// (mirrors `NodePolicy::backoff_for_attempt`'s shift cap of 14).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl BackoffPolicy {
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        BackoffPolicy { min_wait, max_wait }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(14);
        let scaled = self.min_wait.as_millis().saturating_mul(1u128 << shift);
        let capped = scaled.min(self.max_wait.as_millis());
        Duration::from_millis(capped.max(self.min_wait.as_millis()) as u64)
    }
}
