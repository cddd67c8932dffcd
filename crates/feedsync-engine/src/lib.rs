//! Client-side feed synchronization engine.
//!
//! Keeps every view of a social feed consistent with one entity cache:
//!
//! - **EntityCache**: one canonical record per post or user, with per-id callbacks
//! - **OptimisticMutator**: like/save/follow toggles applied before the server
//!   confirms them, serialized per entity and field, rolled back on failure
//! - **PaginatedFeedLoader**: idempotent infinite scroll with per-feed dedup
//! - **NotificationStream**: push subscription merged with a REST snapshot
//! - **ViewBinder**: subscribes UI surfaces to cached entities
//!
//! [`FeedSync`] bundles them for one signed-in viewer.

pub mod backend;
pub mod cache;
mod config;
mod engine;
pub mod entity;
mod error;
pub mod feed;
pub mod mutator;
pub mod notifications;
mod session;
pub mod view;

#[cfg(test)]
mod testing;

pub use backend::{FeedBackend, FeedPage, PushTransport};
pub use cache::{CacheUpdate, EntityCache, Subscription};
pub use config::{DEFAULT_PAGE_SIZE, ReconnectConfig, SyncConfig};
pub use engine::{CommentDraft, FeedSync, PostDraft};
pub use entity::{
    AuthorRef, CodeSnippet, Entity, EntityKind, EntityPatch, MutationField, Post, PostPatch, User,
    UserPatch,
};
pub use error::SyncError;
pub use feed::{FeedCursor, FeedKind, LoadOutcome, PaginatedFeedLoader};
pub use mutator::{
    AttemptState, MutationOutcome, MutationRequest, OptimisticMutator, PendingMutation,
};
pub use notifications::{NotificationEvent, NotificationStream, StreamState};
pub use session::Session;
pub use view::ViewBinder;
