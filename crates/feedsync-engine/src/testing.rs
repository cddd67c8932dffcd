//! Scripted backend used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feedsync_api::{
    ApiError, CommentDto, LikeDto, NewComment, NewPost, NotificationDto, Page, PostDto, UserDto,
    UserMetadata,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{FeedBackend, FeedPage, PushTransport};
use crate::entity::EntityPatch;
use crate::feed::FeedKind;
use crate::mutator::MutationRequest;

pub(crate) fn rejected() -> ApiError {
    ApiError::Status {
        status: 500,
        body: "boom".to_string(),
    }
}

pub(crate) fn post_dto(id: &str, likes: u64) -> PostDto {
    PostDto {
        id: id.to_string(),
        title: None,
        content: None,
        code: None,
        language: None,
        images: None,
        user_metadata: None,
        likes: Some(likes),
        comments: None,
        comment_count: None,
        liked: None,
        saved: None,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn user_dto(id: &str, followers: u64) -> UserDto {
    UserDto {
        user_id: id.to_string(),
        username: None,
        name: None,
        bio: None,
        image_url: None,
        followers_count: Some(followers),
        following_count: None,
        followed_by_me: None,
    }
}

pub(crate) fn post_page(items: Vec<PostDto>, current: u32, total: u32) -> FeedPage {
    FeedPage::Posts(Page {
        items,
        current_page: current,
        total_pages: total,
    })
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or_default()
}

pub(crate) fn notification(id: &str, sender: &str, secs: i64) -> NotificationDto {
    NotificationDto {
        id: id.to_string(),
        message: format!("someone liked your post p{}", id),
        post_id: None,
        sender_user_id: sender.to_string(),
        image_url: None,
        timestamp: at(secs),
    }
}

pub(crate) fn comment(id: &str, content: &str) -> CommentDto {
    CommentDto {
        id: id.to_string(),
        content: Some(content.to_string()),
        code: None,
        language: None,
        user_metadata: None,
        created_at: None,
    }
}

pub(crate) fn users_page(items: Vec<UserDto>, current: u32, total: u32) -> FeedPage {
    FeedPage::Users(Page {
        items,
        current_page: current,
        total_pages: total,
    })
}

pub(crate) fn like_by(user_id: &str) -> LikeDto {
    LikeDto {
        user_metadata: UserMetadata {
            user_id: user_id.to_string(),
            username: None,
            name: None,
            bio: None,
            image_url: None,
        },
    }
}

/// Every call yields once before answering, so concurrent callers interleave.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pages: Mutex<VecDeque<Result<FeedPage, ApiError>>>,
    page_calls: Mutex<Vec<(FeedKind, u32)>>,
    mutation_results: Mutex<VecDeque<Result<Option<EntityPatch>, ApiError>>>,
    executed: Mutex<Vec<MutationRequest>>,
    mutations_in_flight: AtomicUsize,
    max_mutations_in_flight: AtomicUsize,
    /// While set, mutation calls never answer.
    hold_mutations: AtomicBool,
    snapshots: Mutex<VecDeque<Result<Vec<NotificationDto>, ApiError>>>,
    pub(crate) snapshot_calls: AtomicUsize,
    posts: Mutex<HashMap<String, PostDto>>,
    users: Mutex<HashMap<String, UserDto>>,
    likes: Mutex<HashMap<String, Vec<LikeDto>>>,
    comments: Mutex<Vec<NewComment>>,
    comment_results: Mutex<VecDeque<Result<CommentDto, ApiError>>>,
    post_comments: Mutex<HashMap<String, Vec<CommentDto>>>,
    created_posts: Mutex<Vec<NewPost>>,
}

impl FakeBackend {
    pub(crate) fn push_page(&self, page: Result<FeedPage, ApiError>) {
        self.pages.lock().push_back(page);
    }

    pub(crate) fn page_calls(&self) -> Vec<(FeedKind, u32)> {
        self.page_calls.lock().clone()
    }

    /// Script the next mutation result; unscripted mutations succeed.
    pub(crate) fn push_mutation(&self, result: Result<Option<EntityPatch>, ApiError>) {
        self.mutation_results.lock().push_back(result);
    }

    pub(crate) fn executed(&self) -> Vec<MutationRequest> {
        self.executed.lock().clone()
    }

    /// Highest number of mutation calls seen running at once.
    pub(crate) fn max_concurrent_mutations(&self) -> usize {
        self.max_mutations_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn hold_mutations(&self) {
        self.hold_mutations.store(true, Ordering::SeqCst);
    }

    /// Script the next snapshot; unscripted snapshots are empty.
    pub(crate) fn push_snapshot(&self, snapshot: Result<Vec<NotificationDto>, ApiError>) {
        self.snapshots.lock().push_back(snapshot);
    }

    pub(crate) fn set_post(&self, post: PostDto) {
        self.posts.lock().insert(post.id.clone(), post);
    }

    pub(crate) fn set_user(&self, user: UserDto) {
        self.users.lock().insert(user.user_id.clone(), user);
    }

    pub(crate) fn set_likes(&self, post_id: &str, likes: Vec<LikeDto>) {
        self.likes.lock().insert(post_id.to_string(), likes);
    }

    pub(crate) fn comments(&self) -> Vec<NewComment> {
        self.comments.lock().clone()
    }

    pub(crate) fn push_comment_result(&self, result: Result<CommentDto, ApiError>) {
        self.comment_results.lock().push_back(result);
    }

    pub(crate) fn set_comments(&self, post_id: &str, comments: Vec<CommentDto>) {
        self.post_comments.lock().insert(post_id.to_string(), comments);
    }

    pub(crate) fn created_posts(&self) -> Vec<NewPost> {
        self.created_posts.lock().clone()
    }
}

#[async_trait]
impl FeedBackend for FakeBackend {
    async fn fetch_page(
        &self,
        kind: &FeedKind,
        page: u32,
        _page_size: u32,
    ) -> Result<FeedPage, ApiError> {
        self.page_calls.lock().push((kind.clone(), page));
        tokio::task::yield_now().await;
        self.pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(post_page(vec![], page, 0)))
    }

    async fn execute(&self, request: &MutationRequest) -> Result<Option<EntityPatch>, ApiError> {
        self.executed.lock().push(request.clone());
        let running = self.mutations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_mutations_in_flight.fetch_max(running, Ordering::SeqCst);
        if self.hold_mutations.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
        self.mutations_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.mutation_results.lock().pop_front().unwrap_or(Ok(None))
    }

    async fn fetch_post(&self, post_id: &str) -> Result<PostDto, ApiError> {
        tokio::task::yield_now().await;
        self.posts
            .lock()
            .get(post_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                resource: post_id.to_string(),
            })
    }

    async fn fetch_user(&self, user_id: &str) -> Result<UserDto, ApiError> {
        tokio::task::yield_now().await;
        self.users
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                resource: user_id.to_string(),
            })
    }

    async fn fetch_likes(&self, post_id: &str) -> Result<Vec<LikeDto>, ApiError> {
        tokio::task::yield_now().await;
        Ok(self.likes.lock().get(post_id).cloned().unwrap_or_default())
    }

    async fn fetch_comments(&self, post_id: &str) -> Result<Vec<CommentDto>, ApiError> {
        tokio::task::yield_now().await;
        Ok(self
            .post_comments
            .lock()
            .get(post_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_post(&self, post: &NewPost) -> Result<PostDto, ApiError> {
        let id = {
            let mut created = self.created_posts.lock();
            created.push(post.clone());
            format!("new{}", created.len())
        };
        tokio::task::yield_now().await;
        let mut dto = post_dto(&id, 0);
        dto.title = Some(post.title.clone());
        dto.content = Some(post.content.clone());
        Ok(dto)
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<CommentDto, ApiError> {
        self.comments.lock().push(comment.clone());
        tokio::task::yield_now().await;
        self.comment_results.lock().pop_front().unwrap_or_else(|| {
            Ok(CommentDto {
                id: format!("c{}", self.comments.lock().len()),
                content: Some(comment.content.clone()),
                code: Some(comment.code.clone()),
                language: Some(comment.language.clone()),
                user_metadata: None,
                created_at: None,
            })
        })
    }

    async fn notification_snapshot(
        &self,
        _user_id: &str,
    ) -> Result<Vec<NotificationDto>, ApiError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.snapshots.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

type PushItem = Result<NotificationDto, ApiError>;

/// Push transport whose connections are fed from the test body.
///
/// Each scripted connection is either a refusal or a channel receiver; the
/// sender side stays with the test, which pushes events and drops it to
/// simulate a disconnect.
#[derive(Default)]
pub(crate) struct FakeTransport {
    connections: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<PushItem>, ApiError>>>,
    pub(crate) connects: AtomicUsize,
}

impl FakeTransport {
    /// Script a successful connection and return its event sender.
    pub(crate) fn accept(&self) -> mpsc::UnboundedSender<PushItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().push_back(Ok(rx));
        tx
    }

    pub(crate) fn refuse(&self) {
        self.connections
            .lock()
            .push_back(Err(ApiError::WebSocket("connection refused".to_string())));
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self) -> Result<BoxStream<'static, PushItem>, ApiError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.connections.lock().pop_front();
        match next {
            Some(Ok(rx)) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(Err(e)) => Err(e),
            None => Err(ApiError::WebSocket("no scripted connection".to_string())),
        }
    }
}
