//! Seams between the engine and the network.
//!
//! The engine only talks to the backend through these traits. The REST client
//! and the hub client from `feedsync-api` implement them; tests use fakes.

use async_trait::async_trait;
use feedsync_api::{
    ApiError, CommentDto, FeedApiClient, HubClient, LikeDto, NewComment, NewPost, NotificationDto,
    Page, PostDto, ToggleAck, UserDto,
};
use futures_util::stream::BoxStream;

use crate::entity::{EntityPatch, PostPatch, UserPatch};
use crate::feed::FeedKind;
use crate::mutator::MutationRequest;

/// One page of a feed listing.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPage {
    Posts(Page<PostDto>),
    Users(Page<UserDto>),
}

impl FeedPage {
    pub fn current_page(&self) -> u32 {
        match self {
            FeedPage::Posts(p) => p.current_page,
            FeedPage::Users(p) => p.current_page,
        }
    }

    pub fn total_pages(&self) -> u32 {
        match self {
            FeedPage::Posts(p) => p.total_pages,
            FeedPage::Users(p) => p.total_pages,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FeedPage::Posts(p) => p.items.len(),
            FeedPage::Users(p) => p.items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the listed entities, in page order.
    pub fn ids(&self) -> Vec<String> {
        match self {
            FeedPage::Posts(p) => p.items.iter().map(|post| post.id.clone()).collect(),
            FeedPage::Users(p) => p.items.iter().map(|user| user.user_id.clone()).collect(),
        }
    }

    /// Whether no page follows this one.
    pub fn is_last(&self) -> bool {
        match self {
            FeedPage::Posts(p) => p.is_last(),
            FeedPage::Users(p) => p.is_last(),
        }
    }
}

/// REST operations the engine needs.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    /// Fetch one page of a feed.
    async fn fetch_page(
        &self,
        kind: &FeedKind,
        page: u32,
        page_size: u32,
    ) -> Result<FeedPage, ApiError>;

    /// Execute a toggle. May return authoritative values for the touched fields.
    async fn execute(&self, request: &MutationRequest) -> Result<Option<EntityPatch>, ApiError>;

    async fn fetch_post(&self, post_id: &str) -> Result<PostDto, ApiError>;

    async fn fetch_user(&self, user_id: &str) -> Result<UserDto, ApiError>;

    async fn fetch_likes(&self, post_id: &str) -> Result<Vec<LikeDto>, ApiError>;

    async fn fetch_comments(&self, post_id: &str) -> Result<Vec<CommentDto>, ApiError>;

    async fn create_comment(&self, comment: &NewComment) -> Result<CommentDto, ApiError>;

    async fn create_post(&self, post: &NewPost) -> Result<PostDto, ApiError>;

    /// Existing notifications for a user.
    async fn notification_snapshot(&self, user_id: &str)
    -> Result<Vec<NotificationDto>, ApiError>;
}

/// Push subscription for notifications.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a subscription. The stream ends or errors when the connection drops.
    async fn connect(
        &self,
    ) -> Result<BoxStream<'static, Result<NotificationDto, ApiError>>, ApiError>;
}

fn ack_to_post(ack: Option<ToggleAck>) -> Option<EntityPatch> {
    let likes = ack?.likes?;
    Some(EntityPatch::Post(PostPatch {
        likes: Some(likes),
        ..Default::default()
    }))
}

fn ack_to_user(ack: Option<ToggleAck>) -> Option<EntityPatch> {
    let followers = ack?.followers_count?;
    Some(EntityPatch::User(UserPatch {
        followers: Some(followers),
        ..Default::default()
    }))
}

#[async_trait]
impl FeedBackend for FeedApiClient {
    async fn fetch_page(
        &self,
        kind: &FeedKind,
        page: u32,
        page_size: u32,
    ) -> Result<FeedPage, ApiError> {
        match kind {
            FeedKind::Global => self.list_posts(page, page_size).await.map(FeedPage::Posts),
            FeedKind::Profile(user_id) => self
                .list_user_posts(user_id, page, page_size)
                .await
                .map(FeedPage::Posts),
            FeedKind::Saved(user_id) => self
                .list_saved_posts(user_id, page, page_size)
                .await
                .map(FeedPage::Posts),
            FeedKind::SearchUsers(query) => self
                .search_users(query, page, page_size)
                .await
                .map(FeedPage::Users),
            FeedKind::Following(user_id) => self
                .list_following(user_id, page, page_size)
                .await
                .map(FeedPage::Users),
        }
    }

    async fn execute(&self, request: &MutationRequest) -> Result<Option<EntityPatch>, ApiError> {
        match request {
            MutationRequest::Like { post_id, viewer_id } => {
                self.set_like(post_id, viewer_id, true).await.map(ack_to_post)
            }
            MutationRequest::Unlike { post_id, viewer_id } => {
                self.set_like(post_id, viewer_id, false).await.map(ack_to_post)
            }
            MutationRequest::Save { post_id, viewer_id } => {
                self.set_saved(post_id, viewer_id, true).await.map(|_| None)
            }
            MutationRequest::Unsave { post_id, viewer_id } => {
                self.set_saved(post_id, viewer_id, false).await.map(|_| None)
            }
            MutationRequest::Follow {
                viewer_id,
                target_id,
            } => self
                .set_follow(viewer_id, target_id, true)
                .await
                .map(ack_to_user),
            MutationRequest::Unfollow {
                viewer_id,
                target_id,
            } => self
                .set_follow(viewer_id, target_id, false)
                .await
                .map(ack_to_user),
        }
    }

    async fn fetch_post(&self, post_id: &str) -> Result<PostDto, ApiError> {
        self.get_post(post_id).await
    }

    async fn fetch_user(&self, user_id: &str) -> Result<UserDto, ApiError> {
        self.get_user(user_id).await
    }

    async fn fetch_likes(&self, post_id: &str) -> Result<Vec<LikeDto>, ApiError> {
        self.list_likes(post_id).await
    }

    async fn fetch_comments(&self, post_id: &str) -> Result<Vec<CommentDto>, ApiError> {
        self.list_comments(post_id).await
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<CommentDto, ApiError> {
        FeedApiClient::create_comment(self, comment).await
    }

    async fn create_post(&self, post: &NewPost) -> Result<PostDto, ApiError> {
        FeedApiClient::create_post(self, post).await
    }

    async fn notification_snapshot(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationDto>, ApiError> {
        self.list_notifications(user_id).await
    }
}

#[async_trait]
impl PushTransport for HubClient {
    async fn connect(
        &self,
    ) -> Result<BoxStream<'static, Result<NotificationDto, ApiError>>, ApiError> {
        let subscription = HubClient::connect(self).await?;
        Ok(subscription.into_stream())
    }
}
