//! Event to subscription matching.
//!
//! A filter is a JSON object whose entries are all required to hold:
//!
//! - keys are field paths into the payload; `customer.region` descends into
//!   nested objects
//! - a scalar expects equality, or membership when the payload value is an array
//! - an array expects the payload value to equal one of its elements
//! - an object is matched recursively against the nested payload object
//!
//! A missing payload field never matches. An absent or empty filter matches
//! every payload.

use serde_json::Value;
use tracing::warn;

use crate::database::models::{EventDbModel, SubscriptionDbModel};

/// Resolve a dotted path inside a JSON value.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = payload.get(path) {
        return Some(direct);
    }
    path.split('.')
        .try_fold(payload, |current, segment| current.get(segment))
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|option| value_matches(actual, option)),
        Value::Object(nested) => nested.iter().all(|(key, expected)| {
            lookup(actual, key).is_some_and(|actual| value_matches(actual, expected))
        }),
        scalar => match actual {
            Value::Array(items) => items.iter().any(|item| item == scalar),
            other => other == scalar,
        },
    }
}

/// Whether `payload` satisfies `filter`.
pub fn filter_matches(filter: Option<&Value>, payload: &Value) -> bool {
    match filter {
        None | Some(Value::Null) => true,
        Some(Value::Object(conditions)) => conditions.iter().all(|(path, expected)| {
            lookup(payload, path).is_some_and(|actual| value_matches(actual, expected))
        }),
        // Non-object filters are rejected at creation; treat legacy rows as no-match.
        Some(_) => false,
    }
}

/// Whether a subscription applies to an event: same tenant, exact event
/// type, active, and filter satisfied.
pub fn subscription_matches(sub: &SubscriptionDbModel, event: &EventDbModel, payload: &Value) -> bool {
    if !sub.active || sub.tenant_id != event.tenant_id || sub.event_type != event.event_type {
        return false;
    }

    match sub.filter_json() {
        Ok(filter) => filter_matches(filter.as_ref(), payload),
        Err(e) => {
            warn!(subscription_id = %sub.id, "Unreadable subscription filter: {}", e);
            false
        }
    }
}

/// Matching subscriptions for an event, ordered by ascending id.
pub fn select_matching<'a>(
    candidates: &'a [SubscriptionDbModel],
    event: &EventDbModel,
    payload: &Value,
) -> Vec<&'a SubscriptionDbModel> {
    let mut matched: Vec<&SubscriptionDbModel> = candidates
        .iter()
        .filter(|sub| subscription_matches(sub, event, payload))
        .collect();
    matched.sort_by(|a, b| a.id.cmp(&b.id));
    matched
}
