//! Notification service facade.
//!
//! The NotificationService is responsible for:
//! - Accepting domain events and waking the dispatcher
//! - Subscription management with channel config validation
//! - Notification queries, cancellation and direct sends
//! - Owning the dispatch loop, the retry sweep and maintenance

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::InAppInbox;
use super::dispatcher::{DispatchSummary, Dispatcher};
use super::registry::ChannelRegistry;
use super::retry::{RetryScheduler, SweepReport};
use crate::config::DispatchConfig;
use crate::database::maintenance::MaintenanceReport;
use crate::database::models::{
    ChannelKind, EventDbModel, NewEvent, NewSubscription, NotificationDbModel, NotificationDraft,
    NotificationFilters, NotificationLogDbModel, NotificationStats, PaginatedResponse,
    PaginationParams, SubscriptionDbModel, SubscriptionUpdate,
};
use crate::database::repositories::{
    EventRepository, NotificationRepository, SqlxEventRepository, SqlxNotificationRepository,
    SqlxSubscriptionRepository, SubscriptionRepository,
};
use crate::database::{Database, MaintenanceScheduler};
use crate::{Error, Result};

/// Ad-hoc notification with an inline target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectNotification {
    pub tenant_id: i64,
    pub channel_kind: ChannelKind,
    pub channel_config: Value,
    /// Derived from the config when absent.
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default = "default_direct_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_direct_event_type() -> String {
    "direct".to_string()
}

impl DirectNotification {
    pub fn new(
        tenant_id: i64,
        channel_kind: ChannelKind,
        channel_config: Value,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            channel_kind,
            channel_config,
            recipient: None,
            user_id: None,
            title: title.into(),
            body: body.into(),
            event_type: default_direct_event_type(),
            metadata: None,
            max_attempts: None,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The notification service.
pub struct NotificationService {
    events: Arc<dyn EventRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    notifications: Arc<dyn NotificationRepository>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<RetryScheduler>,
    maintenance: Arc<MaintenanceScheduler>,
    config: DispatchConfig,
    running: Mutex<Option<Running>>,
}

impl NotificationService {
    /// Wire the service over an opened database.
    pub fn new(
        db: &Database,
        registry: Arc<ChannelRegistry>,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate()?;

        let events: Arc<dyn EventRepository> = Arc::new(SqlxEventRepository::new(
            db.pool.clone(),
            db.write_pool.clone(),
        ));
        let subscriptions: Arc<dyn SubscriptionRepository> = Arc::new(
            SqlxSubscriptionRepository::new(db.pool.clone(), db.write_pool.clone()),
        );
        let notifications: Arc<dyn NotificationRepository> = Arc::new(
            SqlxNotificationRepository::new(db.pool.clone(), db.write_pool.clone()),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            events.clone(),
            subscriptions.clone(),
            notifications.clone(),
            registry.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            dispatcher.clone(),
            notifications.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            events.clone(),
            notifications.clone(),
            db.write_pool.clone(),
            config.maintenance(),
        ));

        Ok(Self {
            events,
            subscriptions,
            notifications,
            registry,
            dispatcher,
            scheduler,
            maintenance,
            config,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn supported_kinds(&self) -> BTreeSet<ChannelKind> {
        self.registry.supported_kinds()
    }

    /// Inbox that `in_app` notifications are delivered to.
    pub fn inbox(&self) -> Arc<InAppInbox> {
        self.registry.inbox()
    }

    // ========== Events ==========

    /// Persist an event and wake the dispatcher. Returns the event id.
    pub async fn ingest_event(&self, event: NewEvent) -> Result<String> {
        let model = EventDbModel::new(&event)?;
        self.events.insert(&model).await?;
        debug!(event_id = %model.id, event_type = %model.event_type, "Event ingested");
        self.dispatcher.wake();
        Ok(model.id)
    }

    pub async fn get_event(&self, id: &str) -> Result<EventDbModel> {
        self.events.get(id).await
    }

    /// Events not yet fanned out.
    pub async fn unprocessed_event_count(&self) -> Result<u64> {
        self.events.count_unprocessed().await
    }

    /// Process one event now instead of waiting for the dispatch loop.
    pub async fn process_event(&self, event_id: &str) -> Result<DispatchSummary> {
        self.dispatcher.process_event(event_id).await
    }

    /// Process one batch of unprocessed events now.
    pub async fn process_pending_events(&self) -> Result<usize> {
        self.dispatcher.process_pending().await
    }

    // ========== Subscriptions ==========

    pub async fn create_subscription(&self, sub: NewSubscription) -> Result<SubscriptionDbModel> {
        self.registry
            .recipient_for(sub.channel_kind, &sub.channel_config, sub.user_id.as_deref())?;
        let model = SubscriptionDbModel::new(&sub)?;
        self.subscriptions.create(&model).await?;
        info!(
            subscription_id = %model.id,
            tenant_id = model.tenant_id,
            event_type = %model.event_type,
            channel = %sub.channel_kind,
            "Subscription created"
        );
        Ok(model)
    }

    pub async fn update_subscription(
        &self,
        id: &str,
        update: SubscriptionUpdate,
    ) -> Result<SubscriptionDbModel> {
        let mut model = self.subscriptions.get(id).await?;
        model.apply(&update)?;
        self.registry.recipient_for(
            model.kind()?,
            &model.config_json()?,
            model.user_id.as_deref(),
        )?;
        self.subscriptions.update(&model).await?;
        Ok(model)
    }

    /// Delete a subscription, cancelling its in-flight notifications.
    /// Returns how many notifications were cancelled.
    pub async fn delete_subscription(&self, id: &str) -> Result<u64> {
        let cancelled = self.subscriptions.delete(id).await?;
        info!(subscription_id = %id, cancelled, "Subscription deleted");
        Ok(cancelled)
    }

    pub async fn set_subscription_active(
        &self,
        id: &str,
        active: bool,
    ) -> Result<SubscriptionDbModel> {
        self.subscriptions.set_active(id, active).await?;
        self.subscriptions.get(id).await
    }

    pub async fn get_subscription(&self, id: &str) -> Result<SubscriptionDbModel> {
        self.subscriptions.get(id).await
    }

    pub async fn list_subscriptions(&self, tenant_id: i64) -> Result<Vec<SubscriptionDbModel>> {
        self.subscriptions.list_by_tenant(tenant_id).await
    }

    // ========== Notifications ==========

    pub async fn list_notifications(
        &self,
        filters: &NotificationFilters,
        pagination: &PaginationParams,
    ) -> Result<PaginatedResponse<NotificationDbModel>> {
        self.notifications.list(filters, pagination).await
    }

    pub async fn get_notification(&self, id: &str) -> Result<NotificationDbModel> {
        self.notifications.get(id).await
    }

    /// Attempt history of a notification, oldest first.
    pub async fn notification_logs(&self, id: &str) -> Result<Vec<NotificationLogDbModel>> {
        self.notifications.get(id).await?;
        self.notifications.logs(id).await
    }

    pub async fn cancel_notification(&self, id: &str) -> Result<NotificationDbModel> {
        let cancelled = self.notifications.cancel(id, "cancelled by request").await?;
        info!(notification_id = %id, "Notification cancelled");
        Ok(cancelled)
    }

    /// Create and attempt a notification that no event or subscription backs.
    pub async fn send_direct(&self, direct: DirectNotification) -> Result<NotificationDbModel> {
        let recipient = match direct.recipient.filter(|r| !r.trim().is_empty()) {
            Some(recipient) => {
                self.registry
                    .check_config(direct.channel_kind, &direct.channel_config)?;
                recipient
            }
            None => self.registry.recipient_for(
                direct.channel_kind,
                &direct.channel_config,
                direct.user_id.as_deref(),
            )?,
        };
        let channel_metadata = match direct.metadata {
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(Error::validation("metadata must be a JSON object")),
            None => Value::Object(Default::default()),
        };

        let draft = NotificationDraft {
            tenant_id: direct.tenant_id,
            event_type: direct.event_type,
            channel_kind: direct.channel_kind,
            channel_config: direct.channel_config,
            recipient,
            title: direct.title,
            body: direct.body,
            channel_metadata,
            max_attempts: direct
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
        };
        self.dispatcher.dispatch_direct(&draft).await
    }

    pub async fn stats(&self, tenant_id: Option<i64>) -> Result<NotificationStats> {
        self.notifications.stats(tenant_id).await
    }

    /// Run one retry sweep now.
    pub async fn run_retry_sweep(&self) -> Result<SweepReport> {
        self.scheduler.run_once().await
    }

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.maintenance.run_maintenance().await
    }

    // ========== Lifecycle ==========

    /// Spawn the dispatch loop, the retry sweep and maintenance.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Notification service already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            self.dispatcher.clone().start(cancel.clone()),
            self.scheduler.clone().start(cancel.clone()),
            self.maintenance.clone().start(cancel.clone()),
        ];
        *running = Some(Running { cancel, handles });

        // Pick up events that arrived while stopped.
        self.dispatcher.wake();
        info!("Notification service started");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        info!("Stopping notification service");
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Notification service stopped");
    }
}
