//! Notification dispatch.
//!
//! Turns domain events into per-subscription notifications and delivers
//! them through pluggable channels with persistent retry state.
//!
//! # Features
//!
//! - Channels: email, push, webhook, SMS, Telegram, Discord, in-app
//! - Subscription filters over the event payload
//! - Exclusive event and notification claims backed by SQLite
//! - Retry with capped exponential backoff and a periodic sweep
//! - Append-only attempt log per notification
//!
//! # Example
//!
//! ```ignore
//! use notify_dispatch::database::Database;
//! use notify_dispatch::database::models::{ChannelKind, NewEvent, NewSubscription};
//! use notify_dispatch::notification::{ChannelRegistry, NotificationService};
//!
//! let db = Database::open("sqlite:notify.db?mode=rwc").await?;
//! let registry = Arc::new(ChannelRegistry::with_defaults()?);
//! let service = NotificationService::new(&db, registry, Default::default())?;
//!
//! service
//!     .create_subscription(NewSubscription::new(
//!         1,
//!         "order.created",
//!         ChannelKind::Webhook,
//!         json!({"url": "https://example.com/hooks/orders"}),
//!     ))
//!     .await?;
//! service.start();
//! service
//!     .ingest_event(NewEvent::new(1, "order.created", json!({"order_id": 42})))
//!     .await?;
//! ```

pub mod channels;
pub mod dispatcher;
pub mod matching;
pub mod registry;
pub mod retry;
pub mod service;
pub mod state;

pub use channels::{Channel, DeliveryResult, FailureKind, InAppInbox, OutboundMessage};
pub use dispatcher::{AttemptTally, DispatchSummary, Dispatcher};
pub use registry::ChannelRegistry;
pub use retry::{RetryScheduler, SweepReport};
pub use service::{DirectNotification, NotificationService};
pub use state::{BackoffPolicy, is_legal_transition};
