//! Retries and a circuit breaker around calls to external services.
//!
//! Breaker states: `Closed` passes calls through and counts consecutive
//! failures; `Open` fails fast until the cooldown elapses; `HalfOpen` lets a
//! single trial through, which either closes the circuit or reopens it.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    services::ServiceError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    #[serde(rename = "cooldown_ms", with = "crate::config::duration_ms")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Per-attempt deadline. Exceeding it counts as a failure.
    #[serde(rename = "deadline_ms", with = "crate::config::duration_ms")]
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            deadline: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with the given deadline.
    pub fn no_retry(deadline: Duration) -> Self {
        Self {
            max_attempts: 1,
            deadline,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    short_circuited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Calls refused without reaching the service.
    pub short_circuited: u64,
}

/// Wraps one external service with retries, deadlines and a breaker.
#[derive(Debug)]
pub struct ResilientServiceClient {
    name: String,
    config: BreakerConfig,
    policy: RetryPolicy,
    breaker: Mutex<Breaker>,
    counters: Counters,
}

/// Permission to make one attempt. A trial that is dropped without an
/// outcome (the caller was cancelled) frees the half-open slot.
struct Attempt<'a> {
    client: &'a ResilientServiceClient,
    trial: bool,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.client.breaker.lock().trial_in_flight = false;
        }
    }
}

enum AttemptOutcome {
    Success,
    Failure,
    /// The service answered but refused the request. Says nothing about
    /// its health.
    Neutral,
}

impl ResilientServiceClient {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            policy,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` under the client's default policy.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        self.call_with(&self.policy, operation).await
    }

    /// Run `operation` with retries and the breaker.
    ///
    /// Each attempt is bounded by `policy.deadline`. Transient failures are
    /// retried with exponential backoff and equal jitter, up to
    /// `policy.max_attempts`. `Rejected` is returned immediately and does
    /// not count against the breaker. While the circuit is open the call
    /// fails with `CircuitOpen` without invoking `operation`.
    pub async fn call_with<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = ServiceError::Unavailable("no attempt made".into());

        for attempt in 1..=max_attempts {
            let permit = self.acquire()?;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let result = tokio::time::timeout(policy.deadline, operation())
                .await
                .unwrap_or_else(|_| {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(ServiceError::Timeout)
                });

            match result {
                Ok(value) => {
                    self.settle(permit, AttemptOutcome::Success);
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => {
                    self.settle(permit, AttemptOutcome::Neutral);
                    return Err(err.into());
                }
                Err(err) => {
                    self.settle(permit, AttemptOutcome::Failure);
                    debug!(
                        service = %self.name,
                        attempt,
                        max_attempts,
                        %err,
                        "service call failed"
                    );
                    last_error = err;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(policy, attempt)).await;
            }
        }

        warn!(service = %self.name, err = %last_error, "service call gave up");
        Err(last_error.into())
    }

    /// Current breaker state. An open circuit whose cooldown has elapsed
    /// reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let breaker = self.breaker.lock();
        match (breaker.state, breaker.opened_at) {
            (CircuitState::Open, Some(at))
                if at.elapsed() >= self.config.cooldown =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            short_circuited: self
                .counters
                .short_circuited
                .load(Ordering::Relaxed),
        }
    }

    fn acquire(&self) -> Result<Attempt<'_>> {
        let mut breaker = self.breaker.lock();
        let trial = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if !cooled {
                    return Err(self.short_circuit());
                }
                info!(service = %self.name, "circuit half-open, allowing a trial call");
                breaker.state = CircuitState::HalfOpen;
                breaker.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    return Err(self.short_circuit());
                }
                breaker.trial_in_flight = true;
                true
            }
        };

        Ok(Attempt {
            client: self,
            trial,
            settled: false,
        })
    }

    fn settle(&self, mut attempt: Attempt<'_>, outcome: AttemptOutcome) {
        attempt.settled = true;
        let mut breaker = self.breaker.lock();
        if attempt.trial {
            breaker.trial_in_flight = false;
        }

        match outcome {
            AttemptOutcome::Success => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                if breaker.state != CircuitState::Closed {
                    info!(service = %self.name, "circuit closed");
                }
                breaker.state = CircuitState::Closed;
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
            }
            AttemptOutcome::Failure => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                breaker.consecutive_failures =
                    breaker.consecutive_failures.saturating_add(1);
                let trip = breaker.state == CircuitState::HalfOpen
                    || breaker.consecutive_failures >= self.config.failure_threshold;
                if trip && breaker.state != CircuitState::Open {
                    warn!(
                        service = %self.name,
                        failures = breaker.consecutive_failures,
                        "circuit opened"
                    );
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
            AttemptOutcome::Neutral => {}
        }
    }

    fn short_circuit(&self) -> Error {
        self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
        Error::CircuitOpen {
            service: self.name.clone(),
        }
    }
}

/// Exponential backoff with equal jitter: half the capped exponential
/// delay, plus a uniform random share of the other half.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let exp = policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay);
    let half = exp / 2;
    let jitter_ms = half.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    half + jitter
}
