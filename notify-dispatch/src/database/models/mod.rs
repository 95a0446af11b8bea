//! Database models.

pub mod event;
pub mod notification;
pub mod pagination;
pub mod subscription;

pub use event::{EventDbModel, NewEvent};
pub use notification::{
    NotificationDbModel, NotificationDraft, NotificationFilters, NotificationLogDbModel,
    NotificationStats, NotificationStatus,
};
pub use pagination::{PaginatedResponse, PaginationParams};
pub use subscription::{ChannelKind, NewSubscription, SubscriptionDbModel, SubscriptionUpdate};
