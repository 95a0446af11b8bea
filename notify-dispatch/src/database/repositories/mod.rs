//! Repository layer for database access.
//!
//! Each repository is a trait plus a sqlx implementation. Multi-row writes
//! that must be atomic go through [`DispatchTxOps`] inside a `BEGIN IMMEDIATE`
//! transaction.

pub mod dispatch_tx;
pub mod event;
pub mod notification;
pub mod subscription;

pub use dispatch_tx::*;
pub use event::*;
pub use notification::*;
pub use subscription::*;
