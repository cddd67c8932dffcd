//! In-memory entity cache.
//!
//! Holds exactly one canonical record per entity id. Every view renders from
//! this cache, and every writer goes through [`EntityCache::upsert`] or one of
//! its variants, so one write reaches every rendering of the entity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::entity::{Entity, EntityKind, EntityPatch, MutationField, Post, User};
use crate::error::SyncError;

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 4096;

/// Update event for asynchronous cache subscribers.
#[derive(Debug, Clone)]
pub enum CacheUpdate {
    /// An entity was created.
    Created { entity: Entity },
    /// An existing entity was merged into.
    Updated { entity: Entity },
    /// An entity was removed.
    Evicted { id: String },
    /// The whole cache was dropped (logout).
    Cleared,
}

type Callback = Arc<dyn Fn(&Entity) + Send + Sync>;

/// Handle returned by [`EntityCache::subscribe`].
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping the handle makes the subscription impossible to remove"]
pub struct Subscription {
    id: String,
    token: u64,
}

impl Subscription {
    /// Entity id this subscription watches.
    pub fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Process-wide entity store.
pub struct EntityCache {
    entities: DashMap<String, Entity>,
    subscribers: DashMap<String, Vec<(u64, Callback)>>,
    next_token: AtomicU64,
    /// Fields with pending optimistic mutations, with a count per lane entry.
    pins: DashMap<(String, MutationField), usize>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl EntityCache {
    /// Create a new empty cache.
    pub fn new() -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            entities: DashMap::new(),
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(1),
            pins: DashMap::new(),
            updates_tx,
        })
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|r| r.value().clone())
    }

    /// Get a post, failing if it is absent or a user.
    pub fn get_post(&self, id: &str) -> Result<Post, SyncError> {
        match self.get(id) {
            Some(Entity::Post(post)) => Ok(post),
            Some(other) => Err(SyncError::KindMismatch {
                id: id.to_string(),
                expected: EntityKind::Post,
                found: other.kind(),
            }),
            None => Err(SyncError::NotCached(id.to_string())),
        }
    }

    /// Get a user, failing if it is absent or a post.
    pub fn get_user(&self, id: &str) -> Result<User, SyncError> {
        match self.get(id) {
            Some(Entity::User(user)) => Ok(user),
            Some(other) => Err(SyncError::KindMismatch {
                id: id.to_string(),
                expected: EntityKind::User,
                found: other.kind(),
            }),
            None => Err(SyncError::NotCached(id.to_string())),
        }
    }

    /// Kind of the cached record, if any.
    pub fn kind_of(&self, id: &str) -> Option<EntityKind> {
        self.entities.get(id).map(|r| r.value().kind())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Merge a patch into the record, creating it if needed.
    pub fn upsert(&self, id: &str, patch: EntityPatch) -> Result<Entity, SyncError> {
        match self.write(id, patch, true)? {
            Some(entity) => Ok(entity),
            None => Err(SyncError::NotCached(id.to_string())),
        }
    }

    /// Merge a patch only if the record already exists.
    ///
    /// Returns false (and writes nothing) when the entity is not cached.
    pub fn patch_existing(&self, id: &str, patch: EntityPatch) -> Result<bool, SyncError> {
        Ok(self.write(id, patch, false)?.is_some())
    }

    /// Merge a fetched snapshot, skipping fields that have a pending
    /// optimistic mutation.
    pub fn upsert_snapshot(&self, id: &str, patch: EntityPatch) -> Result<Entity, SyncError> {
        let pinned: Vec<MutationField> = MutationField::ALL
            .into_iter()
            .filter(|field| field.kind() == patch.kind() && self.is_pinned(id, *field))
            .collect();
        if !pinned.is_empty() {
            debug!(id = %id, pinned = ?pinned, "snapshot skips fields with pending mutations");
        }
        self.upsert(id, patch.without(&pinned))
    }

    fn write(
        &self,
        id: &str,
        patch: EntityPatch,
        create: bool,
    ) -> Result<Option<Entity>, SyncError> {
        let (entity, created) = match self.entities.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let found = entry.get().kind();
                if found != patch.kind() {
                    return Err(SyncError::KindMismatch {
                        id: id.to_string(),
                        expected: patch.kind(),
                        found,
                    });
                }
                entry.get_mut().merge(patch);
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                if !create {
                    trace!(id = %id, "cache: skipping write to absent entity");
                    return Ok(None);
                }
                let entity = Entity::new(id, patch);
                entry.insert(entity.clone());
                (entity, true)
            }
        };

        // Shard lock is released here; callbacks may read the cache.
        self.notify(id, &entity);
        trace!(id = %id, created, "cache: entity upserted");
        let update = if created {
            CacheUpdate::Created {
                entity: entity.clone(),
            }
        } else {
            CacheUpdate::Updated {
                entity: entity.clone(),
            }
        };
        self.broadcast(update);
        Ok(Some(entity))
    }

    /// Remove an entity (e.g. the post was deleted).
    pub fn evict(&self, id: &str) -> Option<Entity> {
        let removed = self.entities.remove(id).map(|(_, entity)| entity);
        if removed.is_some() {
            trace!(id = %id, "cache: entity evicted");
            self.broadcast(CacheUpdate::Evicted { id: id.to_string() });
        }
        removed
    }

    /// Drop every record and pin (logout).
    pub fn clear(&self) {
        self.entities.clear();
        self.pins.clear();
        debug!("cache cleared");
        self.broadcast(CacheUpdate::Cleared);
    }

    /// Register a callback run synchronously on every write to `id`.
    pub fn subscribe(
        &self,
        id: &str,
        callback: impl Fn(&Entity) + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(id.to_string())
            .or_default()
            .push((token, Arc::new(callback)));
        Subscription {
            id: id.to_string(),
            token,
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let Some(mut subs) = self.subscribers.get_mut(&subscription.id) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(token, _)| *token != subscription.token);
        let removed = subs.len() != before;
        let now_empty = subs.is_empty();
        drop(subs);

        if now_empty {
            self.subscribers
                .remove_if(&subscription.id, |_, subs| subs.is_empty());
        }
        removed
    }

    /// Number of live callbacks for an id.
    pub fn subscriber_count(&self, id: &str) -> usize {
        self.subscribers.get(id).map(|s| s.len()).unwrap_or(0)
    }

    /// Subscribe to the update broadcast.
    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    fn notify(&self, id: &str, entity: &Entity) {
        let callbacks: Vec<Callback> = match self.subscribers.get(id) {
            Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(entity);
        }
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    // =========================================================================
    // Pins (owned by the mutator)
    // =========================================================================

    pub(crate) fn pin(&self, id: &str, field: MutationField) {
        *self.pins.entry((id.to_string(), field)).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&self, id: &str, field: MutationField) {
        let key = (id.to_string(), field);
        if let Some(mut count) = self.pins.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        self.pins.remove_if(&key, |_, count| *count == 0);
    }

    /// Whether a field group has a pending optimistic mutation.
    pub fn is_pinned(&self, id: &str, field: MutationField) -> bool {
        self.pins
            .get(&(id.to_string(), field))
            .is_some_and(|count| *count > 0)
    }
}
