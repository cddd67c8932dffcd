//! Optimistic mutations with confirmation and rollback.
//!
//! A mutation is written to the cache before its network call is made. Calls
//! touching the same entity and field group form a FIFO lane: the next call
//! is not fired until the previous one settles, and each queued mutation's
//! optimistic value is computed against the value the cache already shows.
//!
//! Settling the head of a lane with a successor queued never writes to the
//! cache, since the successor's optimistic value is what the viewer sees.
//! Instead the head hands the successor its rollback target: its own
//! pre-mutation values on failure, or the confirmed values on success.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use feedsync_api::{ApiError, CommentDto, NewComment};
use tracing::{debug, trace, warn};

use crate::backend::FeedBackend;
use crate::cache::EntityCache;
use crate::entity::{EntityPatch, MutationField, PostPatch, UserPatch};
use crate::error::SyncError;

/// The network side of a toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRequest {
    Like { post_id: String, viewer_id: String },
    Unlike { post_id: String, viewer_id: String },
    Save { post_id: String, viewer_id: String },
    Unsave { post_id: String, viewer_id: String },
    Follow { viewer_id: String, target_id: String },
    Unfollow { viewer_id: String, target_id: String },
}

impl MutationRequest {
    /// Id of the entity the request changes.
    pub fn entity_id(&self) -> &str {
        match self {
            MutationRequest::Like { post_id, .. }
            | MutationRequest::Unlike { post_id, .. }
            | MutationRequest::Save { post_id, .. }
            | MutationRequest::Unsave { post_id, .. } => post_id,
            MutationRequest::Follow { target_id, .. }
            | MutationRequest::Unfollow { target_id, .. } => target_id,
        }
    }

    pub fn field(&self) -> MutationField {
        match self {
            MutationRequest::Like { .. } | MutationRequest::Unlike { .. } => MutationField::Like,
            MutationRequest::Save { .. } | MutationRequest::Unsave { .. } => MutationField::Save,
            MutationRequest::Follow { .. } | MutationRequest::Unfollow { .. } => {
                MutationField::Follow
            }
        }
    }
}

/// Lifecycle of one mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Applied locally, waiting for its turn in the lane.
    Queued,
    /// Network call issued.
    InFlight,
    Committed,
    RolledBack,
    /// The entity left the cache before the call settled.
    Stale,
}

/// A locally applied mutation awaiting settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub entity_id: String,
    pub field: MutationField,
    /// Values to restore if this mutation fails.
    pub previous: EntityPatch,
    pub optimistic: EntityPatch,
    pub request: MutationRequest,
    pub state: AttemptState,
    seq: u64,
}

/// How a mutation ended.
#[derive(Debug)]
pub enum MutationOutcome {
    /// The server accepted the change.
    Committed,
    /// The server rejected it; the cache was restored.
    RolledBack(ApiError),
    /// The entity was evicted while the call was pending; nothing was written.
    Stale,
}

impl MutationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, MutationOutcome::Committed)
    }

    pub fn state(&self) -> AttemptState {
        match self {
            MutationOutcome::Committed => AttemptState::Committed,
            MutationOutcome::RolledBack(_) => AttemptState::RolledBack,
            MutationOutcome::Stale => AttemptState::Stale,
        }
    }
}

enum Settlement {
    Confirmed(Option<EntityPatch>),
    Failed(ApiError),
    Abandoned,
}

type LaneKey = (String, MutationField);

#[derive(Default)]
struct Lane {
    /// FIFO turn-taking for network calls.
    gate: tokio::sync::Mutex<()>,
    queue: parking_lot::Mutex<VecDeque<PendingMutation>>,
    /// Set on logout; queued mutations settle as stale without calling out.
    closed: AtomicBool,
}

/// Applies, confirms and rolls back optimistic cache writes.
pub struct OptimisticMutator {
    cache: Arc<EntityCache>,
    backend: Arc<dyn FeedBackend>,
    lanes: DashMap<LaneKey, Arc<Lane>>,
    next_seq: AtomicU64,
}

impl OptimisticMutator {
    pub fn new(cache: Arc<EntityCache>, backend: Arc<dyn FeedBackend>) -> Self {
        Self {
            cache,
            backend,
            lanes: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Apply `optimistic` now, run `request`, then commit or restore.
    ///
    /// `inverse` defaults to the cached values of every field `optimistic`
    /// mentions. Fails up front, without writing, if the entity is not cached
    /// or is of the wrong kind.
    pub async fn apply_and_confirm(
        &self,
        entity_id: &str,
        optimistic: EntityPatch,
        inverse: Option<EntityPatch>,
        request: MutationRequest,
    ) -> Result<MutationOutcome, SyncError> {
        let field = request.field();
        if optimistic.kind() != field.kind() {
            return Err(SyncError::KindMismatch {
                id: entity_id.to_string(),
                expected: field.kind(),
                found: optimistic.kind(),
            });
        }
        let current = self
            .cache
            .get(entity_id)
            .ok_or_else(|| SyncError::NotCached(entity_id.to_string()))?;
        if current.kind() != optimistic.kind() {
            return Err(SyncError::KindMismatch {
                id: entity_id.to_string(),
                expected: optimistic.kind(),
                found: current.kind(),
            });
        }

        let previous = inverse.unwrap_or_else(|| optimistic.capture(&current));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key: LaneKey = (entity_id.to_string(), field);

        let (lane, queued_behind) = {
            let lane_ref = self.lanes.entry(key.clone()).or_default();
            let lane = Arc::clone(lane_ref.value());
            let queued_behind = {
                let mut queue = lane.queue.lock();
                queue.push_back(PendingMutation {
                    entity_id: entity_id.to_string(),
                    field,
                    previous,
                    optimistic: optimistic.clone(),
                    request,
                    state: AttemptState::Queued,
                    seq,
                });
                queue.len() - 1
            };
            (lane, queued_behind)
        };

        self.cache.pin(entity_id, field);
        let mut guard = LaneGuard {
            mutator: self,
            key,
            lane,
            seq,
            settled: false,
        };

        self.cache.patch_existing(entity_id, optimistic)?;
        debug!(
            entity_id = %entity_id,
            field = %field,
            queued_behind,
            "optimistic mutation applied"
        );

        let lane = Arc::clone(&guard.lane);
        let _turn = lane.gate.lock().await;

        if guard.lane.closed.load(Ordering::SeqCst) {
            guard.settle(Settlement::Abandoned);
            return Ok(MutationOutcome::Stale);
        }

        let Some(request) = guard.begin() else {
            guard.settled = true;
            return Ok(MutationOutcome::Stale);
        };

        trace!(entity_id = %entity_id, request = ?request, "mutation in flight");
        let settlement = match self.backend.execute(&request).await {
            Ok(authoritative) => Settlement::Confirmed(authoritative),
            Err(e) => Settlement::Failed(e),
        };
        Ok(guard.settle(settlement))
    }

    /// Like or unlike a post, depending on its cached state.
    pub async fn toggle_like(
        &self,
        post_id: &str,
        viewer_id: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let post = self.cache.get_post(post_id)?;
        let like = !post.liked_by_me;
        let likes = if like {
            post.likes + 1
        } else {
            post.likes.saturating_sub(1)
        };
        let (post_id, viewer_id) = (post_id.to_string(), viewer_id.to_string());
        let request = if like {
            MutationRequest::Like {
                post_id: post_id.clone(),
                viewer_id,
            }
        } else {
            MutationRequest::Unlike {
                post_id: post_id.clone(),
                viewer_id,
            }
        };
        let patch = EntityPatch::Post(PostPatch {
            likes: Some(likes),
            liked_by_me: Some(like),
            ..Default::default()
        });
        self.apply_and_confirm(&post_id, patch, None, request).await
    }

    /// Save or unsave a post.
    pub async fn toggle_save(
        &self,
        post_id: &str,
        viewer_id: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let post = self.cache.get_post(post_id)?;
        let save = !post.saved_by_me;
        let (post_id, viewer_id) = (post_id.to_string(), viewer_id.to_string());
        let request = if save {
            MutationRequest::Save {
                post_id: post_id.clone(),
                viewer_id,
            }
        } else {
            MutationRequest::Unsave {
                post_id: post_id.clone(),
                viewer_id,
            }
        };
        let patch = EntityPatch::Post(PostPatch {
            saved_by_me: Some(save),
            ..Default::default()
        });
        self.apply_and_confirm(&post_id, patch, None, request).await
    }

    /// Follow or unfollow a user; the follower count moves with it.
    ///
    /// Following yourself is refused before anything is written.
    pub async fn toggle_follow(
        &self,
        target_id: &str,
        viewer_id: &str,
    ) -> Result<MutationOutcome, SyncError> {
        if target_id == viewer_id {
            return Err(SyncError::SelfFollow);
        }
        let user = self.cache.get_user(target_id)?;
        let follow = !user.followed_by_me;
        let followers = if follow {
            user.followers + 1
        } else {
            user.followers.saturating_sub(1)
        };
        let (target_id, viewer_id) = (target_id.to_string(), viewer_id.to_string());
        let request = if follow {
            MutationRequest::Follow {
                viewer_id,
                target_id: target_id.clone(),
            }
        } else {
            MutationRequest::Unfollow {
                viewer_id,
                target_id: target_id.clone(),
            }
        };
        let patch = EntityPatch::User(UserPatch {
            followers: Some(followers),
            followed_by_me: Some(follow),
            ..Default::default()
        });
        self.apply_and_confirm(&target_id, patch, None, request).await
    }

    /// Post a comment, then bump the cached comment count.
    ///
    /// Not optimistic: the count only moves once the server accepted the
    /// comment. A draft with neither text nor code is refused locally.
    pub async fn submit_comment(&self, comment: &NewComment) -> Result<CommentDto, SyncError> {
        if comment.content.trim().is_empty() && comment.code.trim().is_empty() {
            return Err(SyncError::EmptyComment);
        }

        let created = self.backend.create_comment(comment).await?;

        if let Some(post) = self.cache.get(&comment.post_id).and_then(|e| e.as_post().cloned()) {
            self.cache.patch_existing(
                &comment.post_id,
                EntityPatch::Post(PostPatch {
                    comment_count: Some(post.comment_count + 1),
                    ..Default::default()
                }),
            )?;
        }
        debug!(post_id = %comment.post_id, comment_id = %created.id, "comment created");
        Ok(created)
    }

    /// Unsettled mutations for one lane, head first.
    pub fn pending(&self, entity_id: &str, field: MutationField) -> Vec<PendingMutation> {
        self.lanes
            .get(&(entity_id.to_string(), field))
            .map(|lane| lane.queue.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of unsettled mutations.
    pub fn pending_count(&self) -> usize {
        self.lanes.iter().map(|lane| lane.queue.lock().len()).sum()
    }

    /// Drop every lane (logout). Queued mutations settle as stale without
    /// calling the backend; calls already in flight finish but write nothing
    /// to a cleared cache.
    pub fn reset(&self) {
        for lane in self.lanes.iter() {
            lane.closed.store(true, Ordering::SeqCst);
        }
        self.lanes.clear();
    }
}

/// Owns one queued mutation until it settles. Dropping it unsettled (the
/// caller's future was cancelled) rolls the mutation back.
struct LaneGuard<'a> {
    mutator: &'a OptimisticMutator,
    key: LaneKey,
    lane: Arc<Lane>,
    seq: u64,
    settled: bool,
}

impl LaneGuard<'_> {
    /// Mark the mutation in flight and return its request.
    fn begin(&self) -> Option<MutationRequest> {
        let mut queue = self.lane.queue.lock();
        let entry = queue.iter_mut().find(|m| m.seq == self.seq)?;
        entry.state = AttemptState::InFlight;
        Some(entry.request.clone())
    }

    fn settle(&mut self, settlement: Settlement) -> MutationOutcome {
        self.settled = true;
        let (entity_id, field) = (&self.key.0, self.key.1);

        let (entry, write) = {
            let mut queue = self.lane.queue.lock();
            let Some(pos) = queue.iter().position(|m| m.seq == self.seq) else {
                return MutationOutcome::Stale;
            };
            let Some(entry) = queue.remove(pos) else {
                return MutationOutcome::Stale;
            };

            let target = match &settlement {
                Settlement::Confirmed(authoritative) => authoritative
                    .clone()
                    .map(|auth| entry.optimistic.clone().overlay(auth)),
                Settlement::Failed(_) | Settlement::Abandoned => Some(entry.previous.clone()),
            };

            let write = match queue.get_mut(pos) {
                Some(successor) => {
                    // Without a target the successor's captured values already match the server.
                    if let Some(target) = target {
                        successor.previous = successor.previous.clone().overlay(target);
                        trace!(
                            entity_id = %entity_id,
                            field = %field,
                            "rollback target handed to successor"
                        );
                    }
                    None
                }
                None => target,
            };
            (entry, write)
        };

        self.mutator.cache.unpin(entity_id, field);
        self.mutator
            .lanes
            .remove_if(&self.key, |_, lane| {
                Arc::ptr_eq(lane, &self.lane) && lane.queue.lock().is_empty()
            });

        if !self.mutator.cache.contains(entity_id) {
            debug!(
                entity_id = %entity_id,
                field = %field,
                "entity evicted before mutation settled"
            );
            return MutationOutcome::Stale;
        }

        if let Some(patch) = write
            && let Err(e) = self.mutator.cache.patch_existing(entity_id, patch)
        {
            warn!(entity_id = %entity_id, error = %e, "failed to write mutation settlement");
        }

        match settlement {
            Settlement::Confirmed(_) => {
                debug!(entity_id = %entity_id, request = ?entry.request, "mutation committed");
                MutationOutcome::Committed
            }
            Settlement::Failed(e) => {
                warn!(
                    entity_id = %entity_id,
                    field = %field,
                    error = %e,
                    "mutation rejected, rolled back"
                );
                MutationOutcome::RolledBack(e)
            }
            Settlement::Abandoned => MutationOutcome::Stale,
        }
    }
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                entity_id = %self.key.0,
                field = %self.key.1,
                "mutation cancelled, rolling back"
            );
            self.settle(Settlement::Abandoned);
        }
    }
}
