//! CRM Sync Adapter
//!
//! Wraps the raw [`ContactStore`] calls in bounded exponential-backoff
//! retry and a circuit breaker. Retry applies only to retryable
//! failures (network errors, timeouts, 5xx); payload rejections
//! surface immediately and version conflicts pass straight through to
//! the merge engine's own retry loop. When the breaker is open the
//! adapter fails fast so callers can queue the work for deferred
//! reconciliation instead of blocking the inbound request path.

use leadflow_common::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::models::Contact;
use crate::services::crm_client::{ContactStore, ContactUpdate, CreateOutcome};

/// Exponential backoff schedule for CRM calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 500,
            factor: 2.0,
            cap_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let delay = (self.base_ms as f64) * self.factor.powi(exp as i32);
        Duration::from_millis((delay as u64).min(self.cap_ms))
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker
///
/// Opens after `threshold` consecutive availability failures, rejects
/// work for `cooldown`, then lets a single probe attempt through
/// (half-open) and re-opens on probe failure.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock");
        match &*state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        *state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        match &*state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    warn!(threshold = self.threshold, "Circuit breaker opened");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen => {
                *state = BreakerState::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            *self.state.lock().expect("breaker lock"),
            BreakerState::Open { .. }
        )
    }
}

/// Retrying, circuit-broken facade over the contact store
pub struct SyncAdapter {
    store: Arc<dyn ContactStore>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl SyncAdapter {
    pub fn new(
        store: Arc<dyn ContactStore>,
        policy: RetryPolicy,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            breaker: CircuitBreaker::new(breaker_threshold, breaker_cooldown),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Whether the breaker is currently rejecting work
    pub fn circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Create a contact, with retry. Runs only after the identity
    /// resolver reported no match; the store itself guards against
    /// duplicate creation for races the resolver could not see.
    pub async fn create(&self, contact: &Contact) -> Result<CreateOutcome> {
        self.with_retry("create contact", || self.store.create_contact(contact))
            .await
    }

    /// Apply a conditional update, with retry. A version conflict is
    /// returned immediately: the merge engine owns conflict retries.
    pub async fn update(&self, update: &ContactUpdate) -> Result<()> {
        self.with_retry("update contact", || self.store.update_contact(update))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            if !self.breaker.can_execute() {
                return Err(Error::sync_retryable(format!(
                    "{}: circuit breaker open",
                    op
                )));
            }

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    self.breaker.record_failure();
                    let delay = self.policy.delay(attempt);
                    warn!(
                        op = op,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "CRM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        // Attempts exhausted on an availability failure
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
            }
        }
    }
}
