//! Retry and backoff decisions.

use chrono::{DateTime, Duration, Utc};

use crate::error::ErrorKind;
use crate::playbook::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_eligible_at: DateTime<Utc> },
    Fail,
}

/// Decide what follows failed attempt `attempt` (1-based).
pub fn decide(policy: &RetryPolicy, attempt: u32, kind: ErrorKind, now: DateTime<Utc>) -> RetryDecision {
    if attempt >= policy.max_attempts || !policy.retryable_error_kinds.contains(&kind) {
        return RetryDecision::Fail;
    }
    RetryDecision::Retry {
        next_eligible_at: now + Duration::milliseconds(backoff_delay_ms(&policy.backoff, attempt) as i64),
    }
}

/// Delay after failed attempt `attempt` (1-based).
pub fn backoff_delay_ms(backoff: &Backoff, attempt: u32) -> u64 {
    match *backoff {
        Backoff::Fixed { delay_ms } => delay_ms,
        Backoff::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        } => {
            let exponent = attempt.saturating_sub(1) as i32;
            let delay = initial_ms as f64 * multiplier.powi(exponent);
            if !delay.is_finite() || delay >= max_ms as f64 {
                max_ms
            } else {
                delay.max(0.0) as u64
            }
        }
    }
}
