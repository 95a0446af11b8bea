//! Event fan-out and the shared attempt procedure.
//!
//! Processing an event:
//! 1. Load it and resolve the matching subscriptions.
//! 2. In one immediate transaction, flip `processed` and insert one
//!    pre-claimed `pending` notification per match. Losing the flip means
//!    another worker owns the event.
//! 3. Attempt every created notification concurrently.
//!
//! The retry scheduler reuses [`Dispatcher::attempt`] for due rows.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channels::{Channel, DeliveryResult, OutboundMessage};
use super::matching::select_matching;
use super::registry::ChannelRegistry;
use super::state::{AttemptState, BackoffPolicy, attempt_log, plan_attempt};
use crate::config::DispatchConfig;
use crate::database::models::{
    ChannelKind, EventDbModel, NotificationDbModel, NotificationDraft, NotificationStatus,
    SubscriptionDbModel,
};
use crate::database::repositories::{
    EventRepository, NotificationRepository, RecordOutcome, SubscriptionRepository,
};
use crate::database::time::{add_duration_ms, now_ms};
use crate::{Error, Result};

/// Slack on top of the send timeout when a claim is renewed for a send.
const SEND_LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Final status counts for a batch of attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptTally {
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Rows not attempted: lost claim, already terminal, or an internal error.
    pub skipped: usize,
}

impl AttemptTally {
    fn record(&mut self, outcome: &Result<Option<NotificationStatus>>) {
        match outcome {
            Ok(Some(NotificationStatus::Sent)) => self.sent += 1,
            Ok(Some(NotificationStatus::Retrying)) => self.retrying += 1,
            Ok(Some(NotificationStatus::Failed)) => self.failed += 1,
            Ok(Some(NotificationStatus::Cancelled)) => self.cancelled += 1,
            Ok(Some(NotificationStatus::Pending)) | Ok(None) | Err(_) => self.skipped += 1,
        }
    }

    pub(crate) fn from_outcomes(outcomes: &[Result<Option<NotificationStatus>>]) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            tally.record(outcome);
        }
        tally
    }
}

/// What processing one event did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub event_id: String,
    /// False if the event was already processed or another worker won it.
    pub claimed: bool,
    pub matched: usize,
    pub created: usize,
    pub attempts: AttemptTally,
}

enum Target {
    Send {
        kind: ChannelKind,
        config: Value,
        recipient: String,
    },
    /// The stored kind or config cannot be read.
    Unusable(String),
    Cancel(String),
}

/// Turns events into notifications and drives single attempts.
pub struct Dispatcher {
    events: Arc<dyn EventRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    notifications: Arc<dyn NotificationRepository>,
    registry: Arc<ChannelRegistry>,
    config: DispatchConfig,
    backoff: BackoffPolicy,
    send_permits: Semaphore,
    wake: Notify,
}

impl Dispatcher {
    pub fn new(
        events: Arc<dyn EventRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        notifications: Arc<dyn NotificationRepository>,
        registry: Arc<ChannelRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            events,
            subscriptions,
            notifications,
            registry,
            backoff: config.backoff(),
            send_permits: Semaphore::new(config.max_concurrent_sends),
            config,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Wake the event loop. A wake while it is busy is kept for the next wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Expiry of a claim taken now.
    pub(crate) fn lease_until(&self, now: i64) -> i64 {
        add_duration_ms(now, self.config.claim_lease())
    }

    /// Fan out one event and make the first attempt on each notification.
    pub async fn process_event(&self, event_id: &str) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary {
            event_id: event_id.to_string(),
            ..Default::default()
        };

        let event = self.events.get(event_id).await?;
        if event.processed {
            debug!(event_id = %event_id, "Event already processed");
            return Ok(summary);
        }

        let payload = event.payload_json()?;
        let metadata = event.metadata_json()?;
        let candidates = self
            .subscriptions
            .list_active_for(event.tenant_id, &event.event_type)
            .await?;
        let matched = select_matching(&candidates, &event, &payload);
        summary.matched = matched.len();

        let token = Uuid::new_v4().to_string();
        let lease_until = self.lease_until(now_ms());
        let mut pending = Vec::with_capacity(matched.len());
        for sub in matched {
            let notification = self.build_notification(&event, &payload, &metadata, sub)?;
            pending.push(notification.with_claim(&token, lease_until));
        }

        let created = match self.notifications.create_for_event(&event.id, &pending).await {
            Ok(created) => created,
            Err(e) if e.is_conflict() => {
                debug!(event_id = %event.id, "Event claimed by another worker");
                return Ok(summary);
            }
            Err(e) => return Err(e),
        };
        summary.claimed = true;
        summary.created = created.len();

        let outcomes = join_all(created.iter().map(|n| self.attempt(&n.id, &token))).await;
        for (notification, outcome) in created.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                error!(notification_id = %notification.id, error = %e, "Attempt failed");
            }
        }
        summary.attempts = AttemptTally::from_outcomes(&outcomes);

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = event.tenant_id,
            matched = summary.matched,
            created = summary.created,
            sent = summary.attempts.sent,
            retrying = summary.attempts.retrying,
            failed = summary.attempts.failed,
            "Event dispatched"
        );
        Ok(summary)
    }

    /// Process up to one batch of unprocessed events. Returns how many were taken.
    pub async fn process_pending(&self) -> Result<usize> {
        let events = self
            .events
            .list_unprocessed(self.config.event_batch_size)
            .await?;
        let taken = events.len();

        futures::stream::iter(events)
            .for_each_concurrent(self.config.max_concurrent_events, |event| async move {
                if let Err(e) = self.process_event(&event.id).await {
                    error!(event_id = %event.id, error = %e, "Failed to process event");
                }
            })
            .await;

        Ok(taken)
    }

    /// Persist a standalone notification and make its first attempt.
    pub async fn dispatch_direct(&self, draft: &NotificationDraft) -> Result<NotificationDbModel> {
        self.registry
            .check_config(draft.channel_kind, &draft.channel_config)?;

        let token = Uuid::new_v4().to_string();
        let notification =
            NotificationDbModel::new(draft)?.with_claim(&token, self.lease_until(now_ms()));
        self.notifications.insert(&notification).await?;

        if let Err(e) = self.attempt(&notification.id, &token).await {
            error!(notification_id = %notification.id, error = %e, "Direct attempt failed");
        }
        self.notifications.get(&notification.id).await
    }

    /// Run one attempt on a notification claimed with `token`.
    ///
    /// Returns the status the row ended in, or `None` if it was not attempted
    /// (terminal, claimed elsewhere, or gone).
    pub async fn attempt(&self, id: &str, token: &str) -> Result<Option<NotificationStatus>> {
        let notification = match self.notifications.get(id).await {
            Ok(n) => n,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let status = notification.status()?;
        if status.is_terminal() || notification.claim_token.as_deref() != Some(token) {
            debug!(notification_id = %id, status = %status, "Skipping notification not held by this worker");
            return Ok(None);
        }

        let result = match self.resolve_target(&notification).await? {
            Target::Send {
                kind,
                config,
                recipient,
            } => {
                let message = OutboundMessage::new(
                    &notification.id,
                    recipient,
                    &notification.title,
                    &notification.body,
                    notification.metadata_json()?,
                );
                match self.registry.create(kind, &config) {
                    Ok(channel) => match self.send_claimed(id, token, channel, &message).await? {
                        Some(result) => result,
                        None => return Ok(None),
                    },
                    Err(e) => DeliveryResult::permanent(
                        format!("Channel configuration rejected: {}", e),
                        Some(json!({ "reason": "configuration" })),
                    ),
                }
            }
            Target::Unusable(reason) => DeliveryResult::permanent(
                format!("Channel target unreadable: {}", reason),
                Some(json!({ "reason": "configuration" })),
            ),
            Target::Cancel(reason) => {
                return match self.notifications.cancel(id, &reason).await {
                    Ok(_) => {
                        info!(notification_id = %id, reason = %reason, "Notification cancelled before attempt");
                        Ok(Some(NotificationStatus::Cancelled))
                    }
                    Err(Error::InvalidStateTransition { .. }) => Ok(None),
                    Err(e) => Err(e),
                };
            }
        };

        let state = AttemptState {
            status,
            attempts: notification.attempts,
            max_attempts: notification.max_attempts,
        };
        let update = plan_attempt(state, &result, now_ms(), &self.backoff)?;
        let log = attempt_log(id, &update, &result);
        let channel = notification.channel_kind.as_str();

        match self
            .notifications
            .record_attempt(id, token, &update, &log)
            .await?
        {
            RecordOutcome::Applied => {
                match update.status {
                    NotificationStatus::Sent => info!(
                        notification_id = %id,
                        channel,
                        attempt = update.attempts,
                        "Notification sent"
                    ),
                    NotificationStatus::Retrying => warn!(
                        notification_id = %id,
                        channel,
                        attempt = update.attempts,
                        next_retry_at = ?update.next_retry_at,
                        error = %result.message,
                        "Delivery failed, will retry"
                    ),
                    _ => warn!(
                        notification_id = %id,
                        channel,
                        attempt = update.attempts,
                        error = %result.message,
                        "Delivery failed permanently"
                    ),
                }
                Ok(Some(update.status))
            }
            RecordOutcome::Discarded { current } => {
                info!(
                    notification_id = %id,
                    current = ?current,
                    "Attempt outcome discarded; row changed during send"
                );
                Ok(current)
            }
        }
    }

    async fn resolve_target(&self, notification: &NotificationDbModel) -> Result<Target> {
        let Some(subscription_id) = notification.subscription_id.as_deref() else {
            let target = notification
                .kind()
                .and_then(|kind| Ok((kind, notification.config_json()?)));
            return Ok(match target {
                Ok((kind, config)) => Target::Send {
                    kind,
                    config,
                    recipient: notification.recipient.clone(),
                },
                Err(e) => Target::Unusable(e.to_string()),
            });
        };

        let sub = match self.subscriptions.get(subscription_id).await {
            Ok(sub) => sub,
            Err(Error::NotFound { .. }) => {
                return Ok(Target::Cancel("subscription deleted".to_string()));
            }
            Err(e) => return Err(e),
        };
        if !sub.active {
            return Ok(Target::Cancel("subscription inactive".to_string()));
        }

        let (kind, config) = match sub.kind().and_then(|kind| Ok((kind, sub.config_json()?))) {
            Ok(target) => target,
            Err(e) => return Ok(Target::Unusable(e.to_string())),
        };
        let recipient = self
            .registry
            .recipient_for(kind, &config, sub.user_id.as_deref())
            .unwrap_or_else(|_| notification.recipient.clone());
        Ok(Target::Send {
            kind,
            config,
            recipient,
        })
    }

    /// Claim expiry for a send starting at `now` that may run for `limit`.
    fn send_lease_until(&self, now: i64, limit: Duration) -> i64 {
        add_duration_ms(now, self.config.claim_lease().max(limit) + SEND_LEASE_MARGIN)
    }

    /// Send under the global limit and the channel timeout.
    ///
    /// Once a permit is held the claim is renewed to outlast the send.
    /// `None` means the claim was lost while queued and nothing was sent.
    async fn send_claimed(
        &self,
        id: &str,
        token: &str,
        channel: Arc<dyn Channel>,
        message: &OutboundMessage,
    ) -> Result<Option<DeliveryResult>> {
        let Ok(_permit) = self.send_permits.acquire().await else {
            return Ok(Some(DeliveryResult::transient("Send limiter closed", None)));
        };

        let limit = channel.timeout().unwrap_or_else(|| self.config.send_timeout());
        let now = now_ms();
        let renewed = self
            .notifications
            .renew_claim(id, token, now, self.send_lease_until(now, limit))
            .await?;
        if !renewed {
            debug!(notification_id = %id, "Claim lost before send");
            return Ok(None);
        }

        let result = match tokio::time::timeout(limit, channel.send(message)).await {
            Ok(result) => result,
            Err(_) => DeliveryResult::transient(
                format!("{} send timed out after {}s", channel.kind(), limit.as_secs()),
                Some(json!({ "reason": "timeout", "timeout_secs": limit.as_secs() })),
            ),
        };
        Ok(Some(result))
    }

    /// Build the row for one matched subscription.
    ///
    /// The subscription's stored target is copied verbatim. When it cannot be
    /// read the row is still created, with an empty recipient, and its first
    /// attempt fails permanently.
    fn build_notification(
        &self,
        event: &EventDbModel,
        payload: &Value,
        metadata: &Value,
        sub: &SubscriptionDbModel,
    ) -> Result<NotificationDbModel> {
        let (kind, config, recipient) =
            match sub.kind().and_then(|kind| Ok((kind, sub.config_json()?))) {
                Ok((kind, config)) => {
                    let recipient = self
                        .registry
                        .recipient_for(kind, &config, sub.user_id.as_deref())
                        .unwrap_or_default();
                    (kind, config, recipient)
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        subscription_id = %sub.id,
                        error = %e,
                        "Subscription target unreadable"
                    );
                    (ChannelKind::Webhook, Value::Object(Map::new()), String::new())
                }
            };
        let max_attempts = sub
            .max_attempts
            .map_or(self.config.default_max_attempts, |n| {
                u32::try_from(n.max(1)).unwrap_or(u32::MAX)
            });

        let draft = NotificationDraft {
            tenant_id: event.tenant_id,
            event_type: event.event_type.clone(),
            channel_kind: kind,
            channel_metadata: channel_metadata(event, payload, &config),
            channel_config: config,
            recipient,
            title: render_title(&event.event_type, metadata, payload),
            body: render_body(metadata, payload),
            max_attempts,
        };
        let mut notification = NotificationDbModel::new(&draft)?.with_source(&event.id, &sub.id);
        notification.channel_kind = sub.channel_kind.clone();
        notification.channel_config = sub.channel_config.clone();
        Ok(notification)
    }

    /// Event loop: drain unprocessed events, then wait for a wake or the poll interval.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                max_concurrent_events = self.config.max_concurrent_events,
                poll_interval_ms = self.config.event_poll_interval_ms,
                "Dispatch loop started"
            );
            loop {
                let full_batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    taken = self.process_pending() => match taken {
                        Ok(n) => n >= self.config.event_batch_size as usize,
                        Err(e) => {
                            error!(error = %e, "Failed to load unprocessed events");
                            false
                        }
                    },
                };
                if full_batch {
                    continue;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.event_poll_interval()) => {}
                }
            }
            debug!("Dispatch loop shutting down");
        })
    }
}

fn first_text(sources: [&Value; 2], keys: &[&str]) -> Option<String> {
    sources.iter().find_map(|source| {
        keys.iter().find_map(|key| {
            source
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    })
}

/// `order.status_changed` -> `Order status changed`.
pub(crate) fn humanize_event_type(event_type: &str) -> String {
    let words: Vec<&str> = event_type
        .split(['.', '_', '-', ' '])
        .filter(|w| !w.is_empty())
        .collect();
    let sentence = words.join(" ").to_lowercase();
    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => event_type.to_string(),
    }
}

pub(crate) fn render_title(event_type: &str, metadata: &Value, payload: &Value) -> String {
    first_text([metadata, payload], &["title"]).unwrap_or_else(|| humanize_event_type(event_type))
}

pub(crate) fn render_body(metadata: &Value, payload: &Value) -> String {
    first_text([metadata, payload], &["body", "message"]).unwrap_or_else(|| payload.to_string())
}

/// Subscription-level `metadata` object plus the event context.
pub(crate) fn channel_metadata(event: &EventDbModel, payload: &Value, config: &Value) -> Value {
    let mut map = match config.get("metadata") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    map.insert("event_id".into(), Value::String(event.id.clone()));
    map.insert("event_type".into(), Value::String(event.event_type.clone()));
    map.insert(
        "source_id".into(),
        event.source_id.clone().map(Value::String).unwrap_or(Value::Null),
    );
    map.insert("payload".into(), payload.clone());
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::NewEvent;

    fn event(payload: Value, metadata: Value) -> EventDbModel {
        EventDbModel::new(
            &NewEvent::new(1, "order.status_changed", payload)
                .with_source("order-42")
                .with_metadata(metadata),
        )
        .unwrap()
    }

    #[test]
    fn test_humanize_event_type() {
        assert_eq!(humanize_event_type("order.created"), "Order created");
        assert_eq!(humanize_event_type("order.status_changed"), "Order status changed");
        assert_eq!(humanize_event_type("RESERVATION-CANCELLED"), "Reservation cancelled");
        assert_eq!(humanize_event_type("..."), "...");
    }

    #[test]
    fn test_title_prefers_metadata_then_payload() {
        let payload = json!({"title": "From payload"});
        assert_eq!(
            render_title("order.created", &json!({"title": "From metadata"}), &payload),
            "From metadata"
        );
        assert_eq!(render_title("order.created", &json!({}), &payload), "From payload");
        assert_eq!(
            render_title("order.created", &json!({"title": "  "}), &json!({})),
            "Order created"
        );
    }

    #[test]
    fn test_body_falls_back_to_compact_payload() {
        assert_eq!(render_body(&json!({}), &json!({"message": "Table ready"})), "Table ready");
        assert_eq!(
            render_body(&json!({"body": "Meta body"}), &json!({"message": "x"})),
            "Meta body"
        );
        assert_eq!(render_body(&json!({}), &json!({"order_id": 7})), r#"{"order_id":7}"#);
    }

    #[test]
    fn test_channel_metadata_merges_subscription_metadata() {
        let payload = json!({"order_id": 7});
        let ev = event(payload.clone(), json!({}));
        let config = json!({"url": "https://example.com", "metadata": {"store": "north-1"}});

        let meta = channel_metadata(&ev, &payload, &config);
        assert_eq!(meta["store"], "north-1");
        assert_eq!(meta["event_id"], ev.id.as_str());
        assert_eq!(meta["event_type"], "order.status_changed");
        assert_eq!(meta["source_id"], "order-42");
        assert_eq!(meta["payload"], payload);
    }

    #[test]
    fn test_channel_metadata_without_subscription_metadata() {
        let ev = EventDbModel::new(&NewEvent::new(1, "order.created", json!({}))).unwrap();
        let meta = channel_metadata(&ev, &json!({}), &json!({"metadata": "not-an-object"}));
        assert_eq!(meta.as_object().unwrap().len(), 4);
        assert!(meta["source_id"].is_null());
    }

    #[test]
    fn test_attempt_tally() {
        let outcomes = vec![
            Ok(Some(NotificationStatus::Sent)),
            Ok(Some(NotificationStatus::Retrying)),
            Ok(Some(NotificationStatus::Retrying)),
            Ok(None),
            Err(Error::Other("boom".into())),
        ];
        let tally = AttemptTally::from_outcomes(&outcomes);
        assert_eq!(tally.sent, 1);
        assert_eq!(tally.retrying, 2);
        assert_eq!(tally.skipped, 2);
    }
}
