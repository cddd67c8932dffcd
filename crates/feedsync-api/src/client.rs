//! REST client for the posts, users and notifications services.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::types::{Listing, SavedItem};
use crate::{
    ApiError, CommentDto, LikeDto, NewComment, NewPost, NotificationDto, Page, PostDto, ToggleAck,
    UserDto,
};

/// Base URLs of the three backend services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub posts: String,
    pub users: String,
    pub notifications: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            posts: "http://localhost:5108".to_string(),
            users: "http://localhost:5172".to_string(),
            notifications: "http://localhost:5068".to_string(),
        }
    }
}

impl Endpoints {
    /// Point every service at the same base URL (test servers, gateways).
    pub fn single(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            posts: base.clone(),
            users: base.clone(),
            notifications: base,
        }
    }
}

/// Retries for idempotent reads: initial attempt + 3 retries.
const READ_ATTEMPTS: u32 = 4;

/// Client for the feed backend.
///
/// Every call carries the bearer token; calling without one fails with
/// [`ApiError::MissingCredential`] before any request is made.
#[derive(Debug, Clone)]
pub struct FeedApiClient {
    http: Client,
    endpoints: Endpoints,
    token: Option<String>,
}

impl FeedApiClient {
    /// Create a new client for the given service endpoints.
    pub fn new(endpoints: Endpoints) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoints,
            token: None,
        })
    }

    /// Attach the bearer token supplied by the auth collaborator.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The configured service endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn bearer(&self) -> Result<&str, ApiError> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::MissingCredential)
    }

    fn page_query(page: u32, page_size: u32) -> Vec<(&'static str, String)> {
        vec![("page", page.to_string()), ("pageSize", page_size.to_string())]
    }

    // =========================================================================
    // Feeds
    // =========================================================================

    /// Global post feed.
    pub async fn list_posts(&self, page: u32, page_size: u32) -> Result<Page<PostDto>, ApiError> {
        let url = format!("{}/api/Post", self.endpoints.posts);
        self.get_json(&url, &Self::page_query(page, page_size), "list_posts")
            .await
    }

    /// Posts authored by one user.
    pub async fn list_user_posts(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<PostDto>, ApiError> {
        let url = format!("{}/api/Post/user/posts/{}", self.endpoints.posts, user_id);
        self.get_json(&url, &Self::page_query(page, page_size), "list_user_posts")
            .await
    }

    /// Posts saved by one user.
    pub async fn list_saved_posts(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<PostDto>, ApiError> {
        let url = format!("{}/api/Post/saved/{}", self.endpoints.posts, user_id);
        let listing: Listing<SavedItem> = self
            .get_json(&url, &Self::page_query(page, page_size), "list_saved_posts")
            .await?;
        Ok(listing.into_post_page())
    }

    /// User search results.
    pub async fn search_users(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<UserDto>, ApiError> {
        let url = format!("{}/api/User/search", self.endpoints.users);
        let mut params = vec![("query", query.to_string())];
        params.extend(Self::page_query(page, page_size));
        let listing: Listing<UserDto> = self.get_json(&url, &params, "search_users").await?;
        Ok(listing.into_page())
    }

    /// Users that `user_id` follows.
    pub async fn list_following(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<UserDto>, ApiError> {
        let url = format!("{}/api/User/{}/following", self.endpoints.users, user_id);
        let listing: Listing<UserDto> = self
            .get_json(&url, &Self::page_query(page, page_size), "list_following")
            .await?;
        Ok(listing.into_page())
    }

    // =========================================================================
    // Single entities
    // =========================================================================

    /// Fetch one post.
    pub async fn get_post(&self, post_id: &str) -> Result<PostDto, ApiError> {
        let url = format!("{}/api/Post/{}", self.endpoints.posts, post_id);
        self.get_json(&url, &[], "get_post").await
    }

    /// Fetch one user profile.
    pub async fn get_user(&self, user_id: &str) -> Result<UserDto, ApiError> {
        let url = format!("{}/api/User/{}", self.endpoints.users, user_id);
        self.get_json(&url, &[], "get_user").await
    }

    /// Every like on a post.
    pub async fn list_likes(&self, post_id: &str) -> Result<Vec<LikeDto>, ApiError> {
        let url = format!("{}/api/Post/likes/{}", self.endpoints.posts, post_id);
        self.get_json(&url, &[], "list_likes").await
    }

    /// Comments on a post.
    pub async fn list_comments(&self, post_id: &str) -> Result<Vec<CommentDto>, ApiError> {
        let url = format!("{}/api/Comment/{}", self.endpoints.posts, post_id);
        self.get_json(&url, &[], "list_comments").await
    }

    /// Notification snapshot for a user.
    pub async fn list_notifications(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationDto>, ApiError> {
        let url = format!(
            "{}/api/Notification/user/{}",
            self.endpoints.notifications, user_id
        );
        self.get_json(&url, &[], "list_notifications").await
    }

    // =========================================================================
    // Mutations (never retried here; the caller owns mutation policy)
    // =========================================================================

    /// Like (`true`) or unlike (`false`) a post as `viewer_id`.
    pub async fn set_like(
        &self,
        post_id: &str,
        viewer_id: &str,
        liked: bool,
    ) -> Result<Option<ToggleAck>, ApiError> {
        let url = format!(
            "{}/api/Post/likes/{}/{}",
            self.endpoints.posts, post_id, viewer_id
        );
        self.toggle(toggle_method(liked), &url).await
    }

    /// Save or unsave a post for `viewer_id`.
    pub async fn set_saved(
        &self,
        post_id: &str,
        viewer_id: &str,
        saved: bool,
    ) -> Result<Option<ToggleAck>, ApiError> {
        let url = format!(
            "{}/api/Post/saved/{}/{}",
            self.endpoints.posts, post_id, viewer_id
        );
        self.toggle(toggle_method(saved), &url).await
    }

    /// Follow or unfollow `target_id` as `viewer_id`.
    ///
    /// Both directions are POSTs; unfollow has its own route.
    pub async fn set_follow(
        &self,
        viewer_id: &str,
        target_id: &str,
        follow: bool,
    ) -> Result<Option<ToggleAck>, ApiError> {
        let action = if follow { "follow" } else { "unfollow" };
        let url = format!(
            "{}/api/User/{}/{}/{}",
            self.endpoints.users, viewer_id, action, target_id
        );
        self.toggle(Method::POST, &url).await
    }

    /// Create a comment on a post.
    pub async fn create_comment(&self, comment: &NewComment) -> Result<CommentDto, ApiError> {
        let url = format!("{}/api/Comment/{}", self.endpoints.posts, comment.post_id);
        debug!(post_id = %comment.post_id, "creating comment");
        self.post_json(&url, comment).await
    }

    /// Publish a new post.
    pub async fn create_post(&self, post: &NewPost) -> Result<PostDto, ApiError> {
        let url = format!("{}/api/Post", self.endpoints.posts);
        debug!(author_id = %post.author_id, "creating post");
        self.post_json(&url, post).await
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let token = self.bearer()?;

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", token))
            .json(body)
            .send()
            .await?;

        Self::handle_response(response, url).await
    }

    async fn toggle(&self, method: Method, url: &str) -> Result<Option<ToggleAck>, ApiError> {
        let token = self.bearer()?;

        debug!(method = %method, url = %url, "toggle request");

        let response = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_for(response, url).await);
        }

        // Toggle endpoints may answer with an empty body or an updated entity.
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str::<ToggleAck>(&body).ok())
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        op: &'static str,
    ) -> Result<T, ApiError> {
        let mut last_error = None;
        for attempt in 0..READ_ATTEMPTS {
            let token = self.bearer()?;

            let sent = self
                .http
                .get(url)
                .header("Authorization", format!("Bearer {}", token))
                .header("accept", "*/*")
                .query(query)
                .send()
                .await;

            let result = match sent {
                Ok(response) => Self::handle_response(response, url).await,
                Err(e) => Err(ApiError::from(e)),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < READ_ATTEMPTS => {
                    let backoff_ms = match &e {
                        ApiError::RateLimited {
                            retry_after_secs: Some(secs),
                            ..
                        } => secs.saturating_mul(1000),
                        _ => 500u64 * (1 << attempt), // 500ms, 1s, 2s
                    };
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in {}, retrying", op
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ApiError::Malformed("retry exhausted".into())))
    }

    /// Check status and decode the JSON body.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, ApiError> {
        if !response.status().is_success() {
            return Err(Self::error_for(response, url).await);
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::Malformed(format!("{} from {}", e, url)))
    }

    async fn error_for(response: reqwest::Response, url: &str) -> ApiError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return ApiError::RateLimited {
                endpoint: Some(url.to_string()),
                retry_after_secs,
            };
        }

        if status == StatusCode::NOT_FOUND {
            return ApiError::NotFound {
                resource: url.to_string(),
            };
        }

        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("failed to read response: {}", e),
        };
        ApiError::Status {
            status: status.as_u16(),
            body,
        }
    }
}

fn toggle_method(on: bool) -> Method {
    if on { Method::POST } else { Method::DELETE }
}
