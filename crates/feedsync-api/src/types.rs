//! Wire types for the feed backend services.
//!
//! The backend is not consistent about id encoding (posts use strings, some
//! user endpoints return numbers) or timestamp offsets, so ids and timestamps
//! go through lenient deserializers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(crate) mod flexible {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    impl RawId {
        fn into_string(self) -> String {
            match self {
                RawId::Str(s) => s,
                RawId::Int(n) => n.to_string(),
                RawId::UInt(n) => n.to_string(),
            }
        }
    }

    /// Accept an id encoded as either a JSON string or a JSON number.
    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        RawId::deserialize(d).map(RawId::into_string)
    }

    /// Parse an RFC 3339 timestamp, or an offset-less one which is taken as UTC.
    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub fn optional_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {}", raw))),
        }
    }
}

/// Author/user summary embedded in posts, likes and comments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetadata {
    #[serde(deserialize_with = "flexible::id")]
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A post as returned by the posts service.
///
/// Viewer-relative flags (`liked`, `saved`) are optional: the list endpoints
/// do not carry them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDto {
    #[serde(deserialize_with = "flexible::id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub user_metadata: Option<UserMetadata>,
    #[serde(default)]
    pub likes: Option<u64>,
    #[serde(default)]
    pub comments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub comment_count: Option<u64>,
    #[serde(default)]
    pub liked: Option<bool>,
    #[serde(default)]
    pub saved: Option<bool>,
    #[serde(default, deserialize_with = "flexible::optional_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible::optional_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PostDto {
    /// Number of comments, from the explicit count or the embedded comment list.
    pub fn comment_total(&self) -> Option<u64> {
        self.comment_count
            .or_else(|| self.comments.as_ref().map(|c| c.len() as u64))
    }
}

/// A user profile as returned by the users service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    #[serde(alias = "id", deserialize_with = "flexible::id")]
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub followers_count: Option<u64>,
    #[serde(default)]
    pub following_count: Option<u64>,
    #[serde(default, alias = "isFollowing")]
    pub followed_by_me: Option<bool>,
}

/// A page of a listing endpoint.
///
/// The posts service names the array `posts`; the users service uses `users`
/// or `data`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(alias = "posts", alias = "users", alias = "data")]
    pub items: Vec<T>,
    pub current_page: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    /// Whether no further page exists after this one.
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || self.current_page >= self.total_pages
    }
}

/// One entry of the saved-posts listing: either wrapped or a bare post.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum SavedItem {
    Wrapped {
        #[serde(rename = "postDto")]
        post_dto: PostDto,
    },
    Bare(PostDto),
}

impl SavedItem {
    fn into_post(self) -> PostDto {
        match self {
            SavedItem::Wrapped { post_dto } => post_dto,
            SavedItem::Bare(post) => post,
        }
    }
}

/// A listing answered with a page envelope, a `data` envelope without paging,
/// or a bare list. The last two are a single, final page.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Listing<T> {
    Paged(Page<T>),
    Enveloped { data: Vec<T> },
    Bare(Vec<T>),
}

impl<T> Listing<T> {
    pub(crate) fn into_page(self) -> Page<T> {
        match self {
            Listing::Paged(page) => page,
            Listing::Enveloped { data: items } | Listing::Bare(items) => Page {
                items,
                current_page: 1,
                total_pages: 1,
            },
        }
    }
}

impl Listing<SavedItem> {
    pub(crate) fn into_post_page(self) -> Page<PostDto> {
        let page = self.into_page();
        Page {
            items: page.items.into_iter().map(SavedItem::into_post).collect(),
            current_page: page.current_page,
            total_pages: page.total_pages,
        }
    }
}

/// Request body for creating a post.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub author_id: String,
    pub title: String,
    pub content: String,
    pub code: String,
    pub language: String,
    pub images: Vec<String>,
}

/// One like on a post.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeDto {
    pub user_metadata: UserMetadata,
}

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDto {
    #[serde(deserialize_with = "flexible::id")]
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "codeSection")]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub user_metadata: Option<UserMetadata>,
    #[serde(default, deserialize_with = "flexible::optional_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Request body for creating a comment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub author_id: String,
    pub post_id: String,
    pub content: String,
    pub code: String,
    pub language: String,
}

/// Optional authoritative state echoed back by a toggle endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleAck {
    #[serde(default)]
    pub likes: Option<u64>,
    #[serde(default)]
    pub followers_count: Option<u64>,
}

/// A notification, as delivered by both the REST snapshot and the push hub.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDto {
    #[serde(deserialize_with = "flexible::id")]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "relatedEntityId")]
    pub post_id: Option<String>,
    #[serde(deserialize_with = "flexible::id")]
    pub sender_user_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(deserialize_with = "flexible::timestamp")]
    pub timestamp: DateTime<Utc>,
}
