//! Notification state machine and retry backoff.
//!
//! ```text
//! pending  ──► sent | retrying | failed | cancelled
//! retrying ──► sent | retrying | failed | cancelled
//! sent, failed, cancelled: terminal
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::channels::DeliveryResult;
use crate::database::models::{NotificationLogDbModel, NotificationStatus};
use crate::database::repositories::AttemptUpdate;
use crate::database::time::add_duration_ms;
use crate::{Error, Result};

/// Exponential backoff: `base * 2^(attempts - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `attempts` attempts have been made.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Whether the state machine allows `from -> to`.
pub fn is_legal_transition(from: NotificationStatus, to: NotificationStatus) -> bool {
    use NotificationStatus::*;
    match from {
        Pending | Retrying => matches!(to, Sent | Retrying | Failed | Cancelled),
        Sent | Failed | Cancelled => false,
    }
}

/// Snapshot of the fields the transition depends on.
#[derive(Debug, Clone, Copy)]
pub struct AttemptState {
    pub status: NotificationStatus,
    pub attempts: i64,
    pub max_attempts: i64,
}

/// Compute the row update for one finished attempt.
///
/// A permanent failure lowers `max_attempts` to the attempt count so a
/// `failed` row always has `attempts == max_attempts`.
pub fn plan_attempt(
    state: AttemptState,
    result: &DeliveryResult,
    now_ms: i64,
    backoff: &BackoffPolicy,
) -> Result<AttemptUpdate> {
    if state.status.is_terminal() {
        return Err(Error::invalid_transition(state.status, "attempt"));
    }
    if state.attempts >= state.max_attempts {
        return Err(Error::invalid_transition(
            format!("{} ({}/{} attempts)", state.status, state.attempts, state.max_attempts),
            "attempt",
        ));
    }

    let attempts = state.attempts + 1;
    let mut update = AttemptUpdate {
        status: NotificationStatus::Sent,
        attempts,
        max_attempts: state.max_attempts,
        attempted_at: now_ms,
        next_retry_at: None,
        sent_at: None,
        failed_at: None,
        external_id: None,
        last_error: None,
    };

    if result.success {
        update.sent_at = Some(now_ms);
        update.external_id = result.external_id.clone();
        return Ok(update);
    }

    update.last_error = Some(result.message.clone());
    if result.is_permanent_failure() {
        update.status = NotificationStatus::Failed;
        update.max_attempts = attempts;
        update.failed_at = Some(now_ms);
    } else if attempts >= state.max_attempts {
        update.status = NotificationStatus::Failed;
        update.failed_at = Some(now_ms);
    } else {
        update.status = NotificationStatus::Retrying;
        let delay = backoff.delay_for(u32::try_from(attempts).unwrap_or(u32::MAX));
        update.next_retry_at = Some(add_duration_ms(now_ms, delay));
    }

    Ok(update)
}

/// Log row describing an attempt and its outcome.
pub fn attempt_log(
    notification_id: &str,
    update: &AttemptUpdate,
    result: &DeliveryResult,
) -> NotificationLogDbModel {
    let details = if result.success {
        None
    } else {
        Some(json!({
            "failure": result.failure,
            "details": result.error_details,
            "next_retry_at": update.next_retry_at,
        }))
    };
    NotificationLogDbModel::new(
        notification_id,
        update.attempts,
        update.status,
        result.message.clone(),
        details.as_ref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use NotificationStatus::*;

    fn state(status: NotificationStatus, attempts: i64, max_attempts: i64) -> AttemptState {
        AttemptState {
            status,
            attempts,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(8), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(3600));
        // attempts=0 treated like the first attempt
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_secs(7), Duration::from_secs(1000));
        let delays: Vec<Duration> = (1..40).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1000));
    }

    #[test]
    fn test_legal_transitions() {
        for to in NotificationStatus::ALL {
            assert!(!is_legal_transition(Sent, to));
            assert!(!is_legal_transition(Failed, to));
            assert!(!is_legal_transition(Cancelled, to));
        }
        assert!(is_legal_transition(Pending, Sent));
        assert!(is_legal_transition(Pending, Retrying));
        assert!(is_legal_transition(Retrying, Retrying));
        assert!(is_legal_transition(Retrying, Cancelled));
        assert!(!is_legal_transition(Retrying, Pending));
    }

    #[test]
    fn test_success_sends() {
        let result = DeliveryResult::delivered("ok", Some("ext-1".into()));
        let update = plan_attempt(state(Pending, 0, 3), &result, 1_000, &BackoffPolicy::default()).unwrap();
        assert_eq!(update.status, Sent);
        assert_eq!(update.attempts, 1);
        assert_eq!(update.sent_at, Some(1_000));
        assert_eq!(update.next_retry_at, None);
        assert_eq!(update.external_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn test_transient_failure_retries_with_backoff() {
        let result = DeliveryResult::transient("timeout", None);
        let policy = BackoffPolicy::default();

        let first = plan_attempt(state(Pending, 0, 3), &result, 0, &policy).unwrap();
        assert_eq!(first.status, Retrying);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.next_retry_at, Some(30_000));

        let second = plan_attempt(state(Retrying, 1, 3), &result, 100_000, &policy).unwrap();
        assert_eq!(second.status, Retrying);
        assert_eq!(second.next_retry_at, Some(160_000));

        let last = plan_attempt(state(Retrying, 2, 3), &result, 200_000, &policy).unwrap();
        assert_eq!(last.status, Failed);
        assert_eq!(last.attempts, 3);
        assert_eq!(last.next_retry_at, None);
        assert_eq!(last.failed_at, Some(200_000));
    }

    #[test]
    fn test_single_attempt_budget_fails_immediately() {
        let result = DeliveryResult::transient("timeout", None);
        let update = plan_attempt(state(Pending, 0, 1), &result, 0, &BackoffPolicy::default()).unwrap();
        assert_eq!(update.status, Failed);
        assert_eq!(update.attempts, 1);
        assert_eq!(update.max_attempts, 1);
        assert!(update.next_retry_at.is_none());
    }

    #[test]
    fn test_permanent_failure_short_circuits() {
        let result = DeliveryResult::permanent("404", None);
        let update = plan_attempt(state(Pending, 0, 5), &result, 0, &BackoffPolicy::default()).unwrap();
        assert_eq!(update.status, Failed);
        assert_eq!(update.attempts, 1);
        assert_eq!(update.max_attempts, 1);
    }

    #[test]
    fn test_terminal_and_exhausted_rows_reject_attempts() {
        let result = DeliveryResult::delivered("ok", None);
        let policy = BackoffPolicy::default();
        assert!(plan_attempt(state(Sent, 1, 3), &result, 0, &policy).is_err());
        assert!(plan_attempt(state(Cancelled, 0, 3), &result, 0, &policy).is_err());
        assert!(plan_attempt(state(Retrying, 3, 3), &result, 0, &policy).is_err());
    }

    #[test]
    fn test_attempt_log_records_failure_details() {
        let result = DeliveryResult::transient("timeout", Some(json!({"reason": "timeout"})));
        let update = plan_attempt(state(Pending, 0, 3), &result, 0, &BackoffPolicy::default()).unwrap();
        let log = attempt_log("n-1", &update, &result);
        assert_eq!(log.attempt, 1);
        assert_eq!(log.status_at_attempt, "retrying");
        let details: serde_json::Value =
            serde_json::from_str(log.error_details.as_deref().unwrap()).unwrap();
        assert_eq!(details["failure"], "transient");
        assert_eq!(details["details"]["reason"], "timeout");
    }
}
