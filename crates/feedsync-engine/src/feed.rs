//! Paginated feed loading.
//!
//! Each [`PaginatedFeedLoader`] is one independent feed instance: its own
//! cursor, its own ordered id list, and at most one page load in flight.
//! Entity attributes go to the shared cache, never into the loader.

use std::collections::HashSet;
use std::sync::Arc;

use feedsync_api::ApiError;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::{FeedBackend, FeedPage};
use crate::cache::EntityCache;
use crate::entity::{EntityKind, EntityPatch, PostPatch, UserPatch};
use crate::error::SyncError;

/// Which listing a loader pages through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Every post, newest first.
    Global,
    /// Posts authored by a user.
    Profile(String),
    /// Posts saved by a user.
    Saved(String),
    /// Users matching a search query.
    SearchUsers(String),
    /// Users a user follows.
    Following(String),
}

impl FeedKind {
    /// Kind of entity the feed materializes.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            FeedKind::SearchUsers(_) | FeedKind::Following(_) => EntityKind::User,
            _ => EntityKind::Post,
        }
    }
}

/// Per-instance pagination state.
#[derive(Debug, Clone, Default)]
pub struct FeedCursor {
    next_page: u32,
    exhausted: bool,
    ids: Vec<String>,
    seen: HashSet<String>,
}

impl FeedCursor {
    fn new() -> Self {
        Self {
            next_page: 1,
            ..Default::default()
        }
    }

    /// Page number the next load will request (1-based).
    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Materialized ids in feed order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Append ids not seen before, keeping first-seen order. Returns the new ones.
    fn append(&mut self, ids: Vec<String>) -> Vec<String> {
        let mut added = Vec::new();
        for id in ids {
            if self.seen.insert(id.clone()) {
                self.ids.push(id.clone());
                added.push(id);
            }
        }
        added
    }

    /// Put an unseen id at the head of the list.
    fn prepend(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.ids.insert(0, id.to_string());
        true
    }
}

/// Result of a [`PaginatedFeedLoader::load_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was loaded; `added` are the ids it contributed.
    Loaded { added: Vec<String>, exhausted: bool },
    /// Another load for this instance is in flight; nothing was requested.
    AlreadyLoading,
    /// The feed has no more pages; nothing was requested.
    Exhausted,
    /// The feed was reset while the page was loading. The cache was updated
    /// but the ids were not appended.
    Discarded,
}

struct LoaderState {
    cursor: FeedCursor,
    generation: u64,
    /// Generation of the load in flight, if any.
    in_flight: Option<u64>,
}

/// Infinite-scroll driver for one feed instance.
pub struct PaginatedFeedLoader {
    kind: FeedKind,
    backend: Arc<dyn FeedBackend>,
    cache: Arc<EntityCache>,
    viewer_id: Option<String>,
    page_size: u32,
    state: Mutex<LoaderState>,
}

impl PaginatedFeedLoader {
    pub fn new(
        kind: FeedKind,
        backend: Arc<dyn FeedBackend>,
        cache: Arc<EntityCache>,
        page_size: u32,
    ) -> Self {
        Self {
            kind,
            backend,
            cache,
            viewer_id: None,
            page_size: page_size.max(1),
            state: Mutex::new(LoaderState {
                cursor: FeedCursor::new(),
                generation: 0,
                in_flight: None,
            }),
        }
    }

    /// Set the viewer, so their own saved and following feeds can mark
    /// posts saved and users followed.
    pub fn with_viewer(mut self, viewer_id: impl Into<String>) -> Self {
        self.viewer_id = Some(viewer_id.into());
        self
    }

    pub fn kind(&self) -> &FeedKind {
        &self.kind
    }

    /// Materialized ids in feed order.
    pub fn ids(&self) -> Vec<String> {
        self.state.lock().cursor.ids.clone()
    }

    /// Snapshot of the cursor.
    pub fn cursor(&self) -> FeedCursor {
        self.state.lock().cursor.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.lock().cursor.exhausted
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Fetch the next page.
    ///
    /// A call while a load is in flight, or after the last page, is a no-op.
    /// On failure the cursor is left as it was and loaded ids are kept.
    pub async fn load_next(&self) -> Result<LoadOutcome, SyncError> {
        let (page, generation) = {
            let mut state = self.state.lock();
            if state.in_flight.is_some() {
                trace!(feed = ?self.kind, "load already in flight");
                return Ok(LoadOutcome::AlreadyLoading);
            }
            if state.cursor.exhausted {
                return Ok(LoadOutcome::Exhausted);
            }
            state.in_flight = Some(state.generation);
            (state.cursor.next_page, state.generation)
        };
        let _flight = InFlight {
            state: &self.state,
            generation,
        };

        debug!(feed = ?self.kind, page, "loading feed page");
        let fetched = self
            .backend
            .fetch_page(&self.kind, page, self.page_size)
            .await?;

        self.validate(&fetched)?;
        let exhausted = fetched.is_last();
        let ids = self.materialize(fetched)?;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(feed = ?self.kind, page, "feed reset during load, dropping page");
            return Ok(LoadOutcome::Discarded);
        }
        let added = state.cursor.append(ids);
        state.cursor.next_page = page + 1;
        state.cursor.exhausted = exhausted;
        debug!(
            feed = ?self.kind,
            page,
            added = added.len(),
            exhausted,
            "feed page loaded"
        );
        Ok(LoadOutcome::Loaded { added, exhausted })
    }

    /// Show a newly created entity at the top of this feed.
    ///
    /// The id must already be cached. Paging is unaffected; if a later page
    /// carries the same id it is not repeated.
    pub fn prepend(&self, id: &str) -> Result<bool, SyncError> {
        let expected = self.kind.entity_kind();
        match self.cache.kind_of(id) {
            None => return Err(SyncError::NotCached(id.to_string())),
            Some(found) if found != expected => {
                return Err(SyncError::KindMismatch {
                    id: id.to_string(),
                    expected,
                    found,
                });
            }
            Some(_) => {}
        }
        let added = self.state.lock().cursor.prepend(id);
        trace!(feed = ?self.kind, id = %id, added, "prepended to feed");
        Ok(added)
    }

    /// Discard the cursor and id list. The cache is untouched.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cursor = FeedCursor::new();
        state.generation += 1;
        state.in_flight = None;
        debug!(feed = ?self.kind, "feed reset");
    }

    /// Reject a page before anything reaches the cache.
    fn validate(&self, page: &FeedPage) -> Result<(), SyncError> {
        let malformed = |reason: String| SyncError::Api(ApiError::Malformed(reason));

        let expected = self.kind.entity_kind();
        let ids: Vec<&str> = match (page, expected) {
            (FeedPage::Posts(p), EntityKind::Post) => {
                p.items.iter().map(|item| item.id.as_str()).collect()
            }
            (FeedPage::Users(p), EntityKind::User) => {
                p.items.iter().map(|item| item.user_id.as_str()).collect()
            }
            _ => {
                return Err(malformed(format!(
                    "{:?} feed returned the wrong entity kind",
                    self.kind
                )));
            }
        };

        if !ids.is_empty() && page.current_page() > page.total_pages() {
            return Err(malformed(format!(
                "page {} of {} is past the end",
                page.current_page(),
                page.total_pages()
            )));
        }

        for id in ids {
            if id.trim().is_empty() {
                return Err(malformed("item without id".to_string()));
            }
            if let Some(found) = self.cache.kind_of(id)
                && found != expected
            {
                return Err(SyncError::KindMismatch {
                    id: id.to_string(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    fn materialize(&self, page: FeedPage) -> Result<Vec<String>, SyncError> {
        let marks_saved = matches!(
            (&self.kind, &self.viewer_id),
            (FeedKind::Saved(owner), Some(viewer)) if owner == viewer
        );
        let marks_followed = matches!(
            (&self.kind, &self.viewer_id),
            (FeedKind::Following(owner), Some(viewer)) if owner == viewer
        );

        let mut ids = Vec::with_capacity(page.len());
        match page {
            FeedPage::Posts(page) => {
                for dto in page.items {
                    let id = dto.id.clone();
                    let mut patch = PostPatch::from(dto);
                    if marks_saved {
                        patch.saved_by_me = Some(true);
                    }
                    self.cache.upsert_snapshot(&id, EntityPatch::Post(patch))?;
                    ids.push(id);
                }
            }
            FeedPage::Users(page) => {
                for dto in page.items {
                    let id = dto.user_id.clone();
                    let mut patch = UserPatch::from(dto);
                    if marks_followed {
                        patch.followed_by_me = Some(true);
                    }
                    self.cache.upsert_snapshot(&id, EntityPatch::User(patch))?;
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Clears the in-flight marker when a load ends, however it ends.
struct InFlight<'a> {
    state: &'a Mutex<LoaderState>,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight == Some(self.generation) {
            state.in_flight = None;
        }
    }
}
