//! Engine facade: one cache, one mutator, one session.

use std::collections::HashSet;
use std::sync::Arc;

use feedsync_api::{CommentDto, FeedApiClient, HubClient, NewComment, NewPost};
use tracing::{debug, info, warn};

use crate::backend::{FeedBackend, PushTransport};
use crate::cache::EntityCache;
use crate::config::SyncConfig;
use crate::entity::{EntityKind, EntityPatch, Post, PostPatch, User, UserPatch};
use crate::error::SyncError;
use crate::feed::{FeedKind, PaginatedFeedLoader};
use crate::mutator::{MutationOutcome, OptimisticMutator};
use crate::notifications::NotificationStream;
use crate::session::Session;
use crate::view::ViewBinder;

/// What the viewer typed into the comment box.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentDraft {
    pub content: String,
    pub code: String,
    pub language: String,
}

/// What the viewer typed into the new-post form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub code: String,
    pub language: String,
    pub images: Vec<String>,
}

/// Upper bound on pages read when reconciling saved or followed state.
const MAX_RECONCILE_PAGES: u32 = 20;

/// The sync engine for one signed-in viewer.
pub struct FeedSync {
    session: Session,
    config: SyncConfig,
    cache: Arc<EntityCache>,
    backend: Arc<dyn FeedBackend>,
    mutator: OptimisticMutator,
}

impl FeedSync {
    /// Start an engine over any backend.
    pub fn start(session: Session, config: SyncConfig, backend: Arc<dyn FeedBackend>) -> Self {
        info!(user_id = %session.current_user_id, "feed sync started");
        let cache = EntityCache::new();
        let mutator = OptimisticMutator::new(Arc::clone(&cache), Arc::clone(&backend));
        Self {
            session,
            config,
            cache,
            backend,
            mutator,
        }
    }

    /// Start an engine talking to the configured REST services.
    pub fn connect(session: Session, config: SyncConfig) -> Result<Self, SyncError> {
        let client = FeedApiClient::new(config.endpoints())?.with_token(session.token.clone());
        Ok(Self::start(session, config, Arc::new(client)))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    /// Drop all cached state and pending lanes.
    pub fn logout(&self) {
        self.mutator.reset();
        self.cache.clear();
        info!(user_id = %self.session.current_user_id, "logged out");
    }

    /// A new, independent feed instance.
    pub fn feed(&self, kind: FeedKind) -> PaginatedFeedLoader {
        PaginatedFeedLoader::new(
            kind,
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            self.config.page_size,
        )
        .with_viewer(self.session.current_user_id.clone())
    }

    /// A view binder over this engine's cache.
    pub fn view(&self) -> ViewBinder {
        ViewBinder::new(Arc::clone(&self.cache))
    }

    pub async fn toggle_like(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
        self.mutator
            .toggle_like(post_id, &self.session.current_user_id)
            .await
    }

    pub async fn toggle_save(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
        self.mutator
            .toggle_save(post_id, &self.session.current_user_id)
            .await
    }

    pub async fn toggle_follow(&self, user_id: &str) -> Result<MutationOutcome, SyncError> {
        self.mutator
            .toggle_follow(user_id, &self.session.current_user_id)
            .await
    }

    /// Post a comment as the viewer; the post's comment count moves on success.
    pub async fn submit_comment(
        &self,
        post_id: &str,
        draft: CommentDraft,
    ) -> Result<CommentDto, SyncError> {
        let comment = NewComment {
            author_id: self.session.current_user_id.clone(),
            post_id: post_id.to_string(),
            content: draft.content,
            code: draft.code,
            language: draft.language,
        };
        self.mutator.submit_comment(&comment).await
    }

    /// Publish a post as the viewer.
    ///
    /// The new post is cached and put at the top of every given feed that
    /// would list it: the global feed and the viewer's own profile.
    pub async fn create_post(
        &self,
        draft: PostDraft,
        feeds: &[&PaginatedFeedLoader],
    ) -> Result<Post, SyncError> {
        if draft.title.trim().is_empty() || draft.content.trim().is_empty() {
            return Err(SyncError::EmptyPost);
        }
        let viewer = &self.session.current_user_id;
        let new_post = NewPost {
            author_id: viewer.clone(),
            title: draft.title,
            content: draft.content,
            code: draft.code,
            language: draft.language,
            images: draft.images,
        };

        let dto = self.backend.create_post(&new_post).await?;
        let id = dto.id.clone();
        let mut patch = PostPatch::from(dto);
        patch.liked_by_me = Some(false);
        patch.saved_by_me = Some(false);
        self.cache.upsert_snapshot(&id, EntityPatch::Post(patch))?;

        for feed in feeds {
            let lists_it = match feed.kind() {
                FeedKind::Global => true,
                FeedKind::Profile(author) => author == viewer,
                _ => false,
            };
            if lists_it {
                feed.prepend(&id)?;
            }
        }
        info!(post_id = %id, "post created");
        self.cache.get_post(&id)
    }

    /// Fetch a post's comments; the cached comment count follows the list.
    pub async fn comments(&self, post_id: &str) -> Result<Vec<CommentDto>, SyncError> {
        let comments = self.backend.fetch_comments(post_id).await?;
        if self.cache.kind_of(post_id) == Some(EntityKind::Post) {
            self.cache.upsert_snapshot(
                post_id,
                EntityPatch::Post(PostPatch {
                    comment_count: Some(comments.len() as u64),
                    ..Default::default()
                }),
            )?;
        }
        debug!(post_id = %post_id, comments = comments.len(), "comments fetched");
        Ok(comments)
    }

    /// Fetch one post (e.g. named by a notification) into the cache.
    pub async fn open_post(&self, post_id: &str) -> Result<Post, SyncError> {
        let dto = self.backend.fetch_post(post_id).await?;
        let id = dto.id.clone();
        self.cache
            .upsert_snapshot(&id, EntityPatch::Post(PostPatch::from(dto)))?;
        self.cache.get_post(&id)
    }

    /// Fetch one user (e.g. a profile header) into the cache.
    pub async fn open_user(&self, user_id: &str) -> Result<User, SyncError> {
        let dto = self.backend.fetch_user(user_id).await?;
        let id = dto.user_id.clone();
        self.cache
            .upsert_snapshot(&id, EntityPatch::User(UserPatch::from(dto)))?;
        self.cache.get_user(&id)
    }

    /// Recompute like count and liked-by-viewer from the post's likes list.
    pub async fn refresh_like_state(&self, post_id: &str) -> Result<Post, SyncError> {
        let likes = self.backend.fetch_likes(post_id).await?;
        let liked = likes
            .iter()
            .any(|like| like.user_metadata.user_id == self.session.current_user_id);
        debug!(post_id = %post_id, likes = likes.len(), liked, "like state refreshed");
        self.cache.upsert_snapshot(
            post_id,
            EntityPatch::Post(PostPatch {
                likes: Some(likes.len() as u64),
                liked_by_me: Some(liked),
                ..Default::default()
            }),
        )?;
        self.cache.get_post(post_id)
    }

    /// Recompute saved-by-viewer for one cached post from the saved listing.
    pub async fn refresh_saved_state(&self, post_id: &str) -> Result<Post, SyncError> {
        self.reconcile_saved(&[post_id.to_string()]).await?;
        self.cache.get_post(post_id)
    }

    /// Recompute followed-by-viewer for one cached user from the viewer's
    /// following list.
    pub async fn refresh_follow_state(&self, user_id: &str) -> Result<User, SyncError> {
        self.reconcile_following(&[user_id.to_string()]).await?;
        self.cache.get_user(user_id)
    }

    /// Set saved-by-viewer on each cached post in `post_ids`. Posts with a
    /// save pending keep their optimistic value.
    pub async fn reconcile_saved(&self, post_ids: &[String]) -> Result<(), SyncError> {
        let saved = self
            .listed_ids(FeedKind::Saved(self.session.current_user_id.clone()))
            .await?;
        for id in post_ids {
            if self.cache.kind_of(id) != Some(EntityKind::Post) {
                continue;
            }
            self.cache.upsert_snapshot(
                id,
                EntityPatch::Post(PostPatch {
                    saved_by_me: Some(saved.contains(id)),
                    ..Default::default()
                }),
            )?;
        }
        debug!(checked = post_ids.len(), saved = saved.len(), "saved state reconciled");
        Ok(())
    }

    /// Set followed-by-viewer on each cached user in `user_ids`.
    pub async fn reconcile_following(&self, user_ids: &[String]) -> Result<(), SyncError> {
        let following = self
            .listed_ids(FeedKind::Following(self.session.current_user_id.clone()))
            .await?;
        for id in user_ids {
            if self.cache.kind_of(id) != Some(EntityKind::User) {
                continue;
            }
            self.cache.upsert_snapshot(
                id,
                EntityPatch::User(UserPatch {
                    followed_by_me: Some(following.contains(id)),
                    ..Default::default()
                }),
            )?;
        }
        debug!(
            checked = user_ids.len(),
            following = following.len(),
            "follow state reconciled"
        );
        Ok(())
    }

    /// Every id a listing holds, read page by page without touching the cache.
    async fn listed_ids(&self, kind: FeedKind) -> Result<HashSet<String>, SyncError> {
        let mut ids = HashSet::new();
        for page in 1..=MAX_RECONCILE_PAGES {
            let fetched = self
                .backend
                .fetch_page(&kind, page, self.config.page_size)
                .await?;
            let last = fetched.is_last();
            ids.extend(fetched.ids());
            if last {
                return Ok(ids);
            }
        }
        warn!(feed = ?kind, pages = MAX_RECONCILE_PAGES, "listing truncated while reconciling");
        Ok(ids)
    }

    /// A notification stream for the viewer over the given transport.
    pub fn notifications(&self, transport: Arc<dyn PushTransport>) -> NotificationStream {
        NotificationStream::new(
            self.session.current_user_id.clone(),
            Arc::clone(&self.backend),
            transport,
            self.config.reconnect.clone(),
        )
    }

    /// The notification hub of the configured notifications service.
    pub fn hub_transport(&self) -> Arc<dyn PushTransport> {
        Arc::new(
            HubClient::from_service_url(&self.config.notifications_url)
                .with_token(self.session.token.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::MutationRequest;
    use crate::testing::{
        FakeBackend, comment, like_by, post_dto, post_page, rejected, user_dto, users_page,
    };
    use pretty_assertions::assert_eq;

    fn engine(backend: &Arc<FakeBackend>) -> FeedSync {
        FeedSync::start(
            Session::new("me", "token"),
            SyncConfig::default(),
            backend.clone(),
        )
    }

    #[tokio::test]
    async fn test_like_in_one_feed_shows_in_another() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 3), post_dto("p2", 0)], 1, 1)));
        backend.push_page(Ok(post_page(vec![post_dto("p1", 3)], 1, 1)));
        let sync = engine(&backend);

        let global = sync.feed(FeedKind::Global);
        let profile = sync.feed(FeedKind::Profile("ada".into()));
        global.load_next().await.unwrap();
        profile.load_next().await.unwrap();

        let global_view = sync.view();
        let profile_view = sync.view();
        assert!(sync.toggle_like("p1").await.unwrap().is_committed());

        let likes = |view: &ViewBinder, feed: &PaginatedFeedLoader| -> Vec<(u64, bool)> {
            view.project(feed)
                .iter()
                .filter_map(|e| e.as_post().map(|p| (p.likes, p.liked_by_me)))
                .collect()
        };
        assert_eq!(likes(&global_view, &global), vec![(4, true), (0, false)]);
        assert_eq!(likes(&profile_view, &profile), vec![(4, true)]);
    }

    #[tokio::test]
    async fn test_comment_count_moves_only_on_success() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 0)], 1, 1)));
        let sync = engine(&backend);
        sync.feed(FeedKind::Global).load_next().await.unwrap();

        backend.push_comment_result(Err(rejected()));
        let draft = CommentDraft {
            content: "<p>nice</p>".into(),
            ..Default::default()
        };
        assert!(sync.submit_comment("p1", draft.clone()).await.is_err());
        assert_eq!(sync.cache().get_post("p1").unwrap().comment_count, 0);

        sync.submit_comment("p1", draft).await.unwrap();
        assert_eq!(sync.cache().get_post("p1").unwrap().comment_count, 1);
        assert_eq!(backend.comments()[1].author_id, "me");

        let empty = sync.submit_comment("p1", CommentDraft::default()).await;
        assert!(matches!(empty, Err(SyncError::EmptyComment)));
        assert_eq!(backend.comments().len(), 2);
    }

    #[tokio::test]
    async fn test_open_post_and_refresh_likes() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_post(post_dto("p9", 0));
        backend.set_likes("p9", vec![like_by("ada"), like_by("me")]);
        let sync = engine(&backend);

        let post = sync.open_post("p9").await.unwrap();
        assert_eq!(post.likes, 0);

        let post = sync.refresh_like_state("p9").await.unwrap();
        assert_eq!((post.likes, post.liked_by_me), (2, true));

        assert!(matches!(
            sync.open_post("missing").await,
            Err(SyncError::Api(feedsync_api::ApiError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_follow_from_opened_profile() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_user(user_dto("ada", 7));
        let sync = engine(&backend);

        assert!(matches!(
            sync.toggle_follow("ada").await,
            Err(SyncError::NotCached(_))
        ));

        let user = sync.open_user("ada").await.unwrap();
        assert_eq!((user.followers, user.followed_by_me), (7, false));

        assert!(sync.toggle_follow("ada").await.unwrap().is_committed());
        let user = sync.cache().get_user("ada").unwrap();
        assert_eq!((user.followers, user.followed_by_me), (8, true));
    }

    #[tokio::test]
    async fn test_follow_self_is_refused() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_user(user_dto("me", 4));
        let sync = engine(&backend);

        sync.open_user("me").await.unwrap();
        assert!(matches!(
            sync.toggle_follow("me").await,
            Err(SyncError::SelfFollow)
        ));
        assert_eq!(sync.cache().get_user("me").unwrap().followers, 4);
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_saved_state_reconciled_before_toggle() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 0), post_dto("p2", 0)], 1, 1)));
        let sync = engine(&backend);
        let global = sync.feed(FeedKind::Global);
        global.load_next().await.unwrap();
        assert!(!sync.cache().get_post("p1").unwrap().saved_by_me);

        // the viewer's saved listing: p1, plus a post not in the cache
        backend.push_page(Ok(post_page(vec![post_dto("p1", 0), post_dto("p7", 0)], 1, 1)));
        sync.reconcile_saved(&global.ids()).await.unwrap();
        assert!(sync.cache().get_post("p1").unwrap().saved_by_me);
        assert!(!sync.cache().get_post("p2").unwrap().saved_by_me);
        assert!(!sync.cache().contains("p7"));
        assert_eq!(
            backend.page_calls()[1],
            (FeedKind::Saved("me".into()), 1)
        );

        // the toggle now unsaves instead of saving twice
        assert!(sync.toggle_save("p1").await.unwrap().is_committed());
        assert_eq!(
            backend.executed(),
            vec![MutationRequest::Unsave {
                post_id: "p1".into(),
                viewer_id: "me".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_follow_state_reads_every_following_page() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_user(user_dto("ada", 7));
        backend.push_page(Ok(users_page(vec![user_dto("bob", 1)], 1, 2)));
        backend.push_page(Ok(users_page(vec![user_dto("ada", 7)], 2, 2)));
        let sync = engine(&backend);

        sync.open_user("ada").await.unwrap();
        let user = sync.refresh_follow_state("ada").await.unwrap();
        assert!(user.followed_by_me);
        assert_eq!(
            backend.page_calls(),
            vec![
                (FeedKind::Following("me".into()), 1),
                (FeedKind::Following("me".into()), 2)
            ]
        );
        assert!(!sync.cache().contains("bob"));

        assert!(sync.toggle_follow("ada").await.unwrap().is_committed());
        let user = sync.cache().get_user("ada").unwrap();
        assert_eq!((user.followers, user.followed_by_me), (6, false));
    }

    #[tokio::test]
    async fn test_create_post_goes_to_top_of_global_feed() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 3)], 1, 1)));
        let sync = engine(&backend);
        let global = sync.feed(FeedKind::Global);
        let others = sync.feed(FeedKind::Profile("ada".into()));
        global.load_next().await.unwrap();

        let empty = sync
            .create_post(
                PostDraft {
                    title: "Hello".into(),
                    ..Default::default()
                },
                &[&global],
            )
            .await;
        assert!(matches!(empty, Err(SyncError::EmptyPost)));
        assert!(backend.created_posts().is_empty());

        let draft = PostDraft {
            title: "Hello".into(),
            content: "<p>first</p>".into(),
            ..Default::default()
        };
        let post = sync.create_post(draft, &[&global, &others]).await.unwrap();
        assert_eq!(post.id, "new1");
        assert_eq!(post.title.as_deref(), Some("Hello"));
        assert!(!post.liked_by_me && !post.saved_by_me);
        assert_eq!(global.ids(), vec!["new1", "p1"]);
        assert!(others.ids().is_empty());
        assert_eq!(backend.created_posts()[0].author_id, "me");
    }

    #[tokio::test]
    async fn test_comments_refresh_comment_count() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_post(post_dto("p1", 0));
        backend.set_comments("p1", vec![comment("c1", "nice"), comment("c2", "+1")]);
        let sync = engine(&backend);
        sync.open_post("p1").await.unwrap();

        let comments = sync.comments("p1").await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(sync.cache().get_post("p1").unwrap().comment_count, 2);

        // uncached posts are listed but not materialized
        assert!(sync.comments("p9").await.unwrap().is_empty());
        assert!(!sync.cache().contains("p9"));
    }

    #[tokio::test]
    async fn test_logout_clears_cache() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_page(Ok(post_page(vec![post_dto("p1", 0)], 1, 1)));
        let sync = engine(&backend);
        sync.feed(FeedKind::Global).load_next().await.unwrap();

        sync.logout();
        assert!(sync.cache().is_empty());
        assert!(matches!(
            sync.toggle_like("p1").await,
            Err(SyncError::NotCached(_))
        ));
    }
}
