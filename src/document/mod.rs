//! The shared feed document.
//!
//! One [`Document`] exists per session. The controller mutates it, the
//! serving worker reads it, and the shutdown coordinator persists it.
//!
//! # Concurrency
//!
//! - All feed mutations take a single writer lock and publish a fresh
//!   `Arc<Vec<FeedRef>>`; readers clone the `Arc` and never block writers
//!   for longer than that clone.
//! - Background refreshes hold an [`UpdateGuard`]. The in-flight count lives
//!   in a `tokio::sync::watch` channel so shutdown can await it reaching zero.
//! - Once sealed, the document refuses new guards and new feeds; guards taken
//!   before the seal may still finish their work.

mod persist;
mod store;
mod types;

pub use store::{Document, UpdateGuard};
pub use types::{
    Activity, AddFeedError, Feed, FeedRef, Item, PersistError, SealedError, UpdateCounts,
};
