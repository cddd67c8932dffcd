//! Error types for the sync engine.

use feedsync_api::ApiError;
use thiserror::Error;

use crate::entity::EntityKind;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Backend call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A write or read addressed an entity as the wrong kind.
    #[error("entity {id} is a {found}, not a {expected}")]
    KindMismatch {
        id: String,
        expected: EntityKind,
        found: EntityKind,
    },

    /// The entity is not in the cache.
    #[error("entity {0} is not cached")]
    NotCached(String),

    /// The notification connection gave up after the configured ceiling.
    #[error("gave up after {attempts} connection attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ApiError },

    /// The bearer token could not be turned into a session.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// A comment with neither text nor code.
    #[error("comment has no content")]
    EmptyComment,

    /// A post needs both a title and content.
    #[error("post needs a title and content")]
    EmptyPost,

    /// The viewer tried to follow themselves.
    #[error("you can't follow yourself")]
    SelfFollow,
}

impl SyncError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the server answered with a response of the wrong shape.
    pub fn is_malformed(&self) -> bool {
        matches!(self, SyncError::Api(e) if e.is_malformed())
    }
}
