//! Bounded retry with exponential backoff
//!
//! Used by storage fetches and database statements. Only errors that report
//! themselves as transient are retried; the backoff sleep races the run's
//! cancellation token so a cancelled run stops waiting immediately.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FailureKind;

/// Default number of attempts (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay before the second attempt
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default ceiling for a single backoff
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Errors that know whether trying again could help
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry settings shared by storage and database operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before attempt 2; doubles for every further attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Randomize each delay into `[delay/2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

/// Progress of one retrying operation; dropped on success or exhaustion
#[derive(Debug)]
pub struct RetryState<E> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<E>,
    pub next_backoff: Duration,
}

impl<E> RetryState<E> {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_error: None,
            next_backoff: Duration::ZERO,
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-transient error, returned after a single attempt
    Permanent { error: E, attempts: u32 },
    /// Every attempt failed transiently
    Exhausted { error: E, attempts: u32 },
    /// Cancellation arrived before or between attempts
    Cancelled { last_error: Option<E>, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn kind(&self) -> FailureKind {
        match self {
            RetryError::Permanent { .. } => FailureKind::Permanent,
            RetryError::Exhausted { .. } => FailureKind::TransientExhausted,
            RetryError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => {
                Some(error)
            },
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => {
                Some(error)
            },
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);
        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// the token is cancelled. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut state = RetryState::new(self.max_attempts.max(1));

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    last_error: state.last_error.take(),
                    attempts: state.attempt,
                });
            }

            state.attempt += 1;
            debug!("{} attempt {}/{}", operation, state.attempt, state.max_attempts);

            let err = match op(state.attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(RetryError::Permanent {
                    error: err,
                    attempts: state.attempt,
                });
            }

            if state.attempt >= state.max_attempts {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation, state.attempt, err
                );
                return Err(RetryError::Exhausted {
                    error: err,
                    attempts: state.attempt,
                });
            }

            state.next_backoff = self.backoff(state.attempt);
            warn!(
                "{} attempt {}/{} failed: {}. Retrying in {}ms...",
                operation,
                state.attempt,
                state.max_attempts,
                err,
                state.next_backoff.as_millis()
            );
            state.last_error = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        last_error: state.last_error.take(),
                        attempts: state.attempt,
                    });
                }
                _ = tokio::time::sleep(state.next_backoff) => {}
            }
        }
    }
}
