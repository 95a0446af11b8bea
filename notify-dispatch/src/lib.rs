//! notify-dispatch library crate.
//!
//! Event-driven notification dispatch: domain events fan out to matching
//! subscriptions, each becoming a persisted notification delivered through a
//! channel with durable retry state.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
