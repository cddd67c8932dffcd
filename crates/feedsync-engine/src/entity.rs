//! Canonical entity records and partial updates.
//!
//! An [`Entity`] is what the cache stores; an [`EntityPatch`] is what every
//! writer hands it. Patches only carry the fields they mention, so merging a
//! patch never erases data another view loaded.

use std::fmt;

use chrono::{DateTime, Utc};
use feedsync_api::{PostDto, UserDto, UserMetadata};
use serde::Serialize;

/// Entity discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Post,
    User,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Post => f.write_str("post"),
            EntityKind::User => f.write_str("user"),
        }
    }
}

/// Author summary carried by a post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorRef {
    pub user_id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub image_url: Option<String>,
}

impl From<UserMetadata> for AuthorRef {
    fn from(meta: UserMetadata) -> Self {
        Self {
            user_id: meta.user_id,
            username: meta.username,
            name: meta.name,
            image_url: meta.image_url,
        }
    }
}

/// Code attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeSnippet {
    pub code: String,
    pub language: Option<String>,
}

/// A post as the viewer currently knows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Post {
    pub id: String,
    pub author: Option<AuthorRef>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub code: Option<CodeSnippet>,
    pub images: Vec<String>,
    pub likes: u64,
    pub liked_by_me: bool,
    pub saved_by_me: bool,
    pub comment_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A followable user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct User {
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub image_url: Option<String>,
    pub followers: u64,
    pub following: u64,
    pub followed_by_me: bool,
}

/// One canonical cache record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Post(Post),
    User(User),
}

impl Entity {
    /// Build a fresh record from a patch; unmentioned fields take defaults.
    pub fn new(id: impl Into<String>, patch: EntityPatch) -> Self {
        let id = id.into();
        let mut entity = match patch.kind() {
            EntityKind::Post => Entity::Post(Post {
                id,
                ..Default::default()
            }),
            EntityKind::User => Entity::User(User {
                id,
                ..Default::default()
            }),
        };
        entity.merge(patch);
        entity
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Post(p) => &p.id,
            Entity::User(u) => &u.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Post(_) => EntityKind::Post,
            Entity::User(_) => EntityKind::User,
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            Entity::Post(p) => Some(p),
            Entity::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Entity::User(u) => Some(u),
            Entity::Post(_) => None,
        }
    }

    /// Merge the fields a patch mentions. A patch of the other kind is ignored.
    ///
    /// Creation and update timestamps are set once and never overwritten.
    pub fn merge(&mut self, patch: EntityPatch) {
        match (self, patch) {
            (Entity::Post(post), EntityPatch::Post(patch)) => {
                set(&mut post.author, patch.author.map(Some));
                set(&mut post.title, patch.title.map(Some));
                set(&mut post.content, patch.content.map(Some));
                set(&mut post.code, patch.code.map(Some));
                set(&mut post.images, patch.images);
                set(&mut post.likes, patch.likes);
                set(&mut post.liked_by_me, patch.liked_by_me);
                set(&mut post.saved_by_me, patch.saved_by_me);
                set(&mut post.comment_count, patch.comment_count);
                if post.created_at.is_none() {
                    post.created_at = patch.created_at;
                }
                if post.updated_at.is_none() {
                    post.updated_at = patch.updated_at;
                }
            }
            (Entity::User(user), EntityPatch::User(patch)) => {
                set(&mut user.username, patch.username.map(Some));
                set(&mut user.name, patch.name.map(Some));
                set(&mut user.bio, patch.bio.map(Some));
                set(&mut user.image_url, patch.image_url.map(Some));
                set(&mut user.followers, patch.followers);
                set(&mut user.following, patch.following);
                set(&mut user.followed_by_me, patch.followed_by_me);
            }
            _ => {}
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Partial post attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPatch {
    pub author: Option<AuthorRef>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub code: Option<CodeSnippet>,
    pub images: Option<Vec<String>>,
    pub likes: Option<u64>,
    pub liked_by_me: Option<bool>,
    pub saved_by_me: Option<bool>,
    pub comment_count: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<PostDto> for PostPatch {
    fn from(dto: PostDto) -> Self {
        let comment_count = dto.comment_total();
        let code = dto
            .code
            .filter(|code| !code.trim().is_empty())
            .map(|code| CodeSnippet {
                code,
                language: dto.language.filter(|l| !l.is_empty()),
            });
        Self {
            author: dto.user_metadata.map(AuthorRef::from),
            title: dto.title,
            content: dto.content,
            code,
            images: dto.images,
            likes: dto.likes,
            liked_by_me: dto.liked,
            saved_by_me: dto.saved,
            comment_count,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
        }
    }
}

/// Partial user attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPatch {
    pub username: Option<String>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub image_url: Option<String>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub followed_by_me: Option<bool>,
}

impl From<UserDto> for UserPatch {
    fn from(dto: UserDto) -> Self {
        Self {
            username: dto.username,
            name: dto.name,
            bio: dto.bio,
            image_url: dto.image_url,
            followers: dto.followers_count,
            following: dto.following_count,
            followed_by_me: dto.followed_by_me,
        }
    }
}

/// A partial update addressed to one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPatch {
    Post(PostPatch),
    User(UserPatch),
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Post(_) => EntityKind::Post,
            EntityPatch::User(_) => EntityKind::User,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EntityPatch::Post(p) => *p == PostPatch::default(),
            EntityPatch::User(u) => *u == UserPatch::default(),
        }
    }

    /// The entity's current values for every field this patch mentions.
    ///
    /// Applying the result undoes applying `self`.
    pub fn capture(&self, entity: &Entity) -> EntityPatch {
        match (self, entity) {
            (EntityPatch::Post(p), Entity::Post(post)) => EntityPatch::Post(PostPatch {
                author: p.author.as_ref().and(post.author.clone()),
                title: p.title.as_ref().and(post.title.clone()),
                content: p.content.as_ref().and(post.content.clone()),
                code: p.code.as_ref().and(post.code.clone()),
                images: p.images.as_ref().map(|_| post.images.clone()),
                likes: p.likes.map(|_| post.likes),
                liked_by_me: p.liked_by_me.map(|_| post.liked_by_me),
                saved_by_me: p.saved_by_me.map(|_| post.saved_by_me),
                comment_count: p.comment_count.map(|_| post.comment_count),
                created_at: None,
                updated_at: None,
            }),
            (EntityPatch::User(u), Entity::User(user)) => EntityPatch::User(UserPatch {
                username: u.username.as_ref().and(user.username.clone()),
                name: u.name.as_ref().and(user.name.clone()),
                bio: u.bio.as_ref().and(user.bio.clone()),
                image_url: u.image_url.as_ref().and(user.image_url.clone()),
                followers: u.followers.map(|_| user.followers),
                following: u.following.map(|_| user.following),
                followed_by_me: u.followed_by_me.map(|_| user.followed_by_me),
            }),
            (EntityPatch::Post(_), Entity::User(_)) => EntityPatch::Post(PostPatch::default()),
            (EntityPatch::User(_), Entity::Post(_)) => EntityPatch::User(UserPatch::default()),
        }
    }

    /// Combine two patches; fields of `newer` win.
    pub fn overlay(self, newer: EntityPatch) -> EntityPatch {
        match (self, newer) {
            (EntityPatch::Post(old), EntityPatch::Post(new)) => EntityPatch::Post(PostPatch {
                author: new.author.or(old.author),
                title: new.title.or(old.title),
                content: new.content.or(old.content),
                code: new.code.or(old.code),
                images: new.images.or(old.images),
                likes: new.likes.or(old.likes),
                liked_by_me: new.liked_by_me.or(old.liked_by_me),
                saved_by_me: new.saved_by_me.or(old.saved_by_me),
                comment_count: new.comment_count.or(old.comment_count),
                created_at: new.created_at.or(old.created_at),
                updated_at: new.updated_at.or(old.updated_at),
            }),
            (EntityPatch::User(old), EntityPatch::User(new)) => EntityPatch::User(UserPatch {
                username: new.username.or(old.username),
                name: new.name.or(old.name),
                bio: new.bio.or(old.bio),
                image_url: new.image_url.or(old.image_url),
                followers: new.followers.or(old.followers),
                following: new.following.or(old.following),
                followed_by_me: new.followed_by_me.or(old.followed_by_me),
            }),
            (old, _) => old,
        }
    }

    /// Drop the fields owned by the given mutation fields.
    pub fn without(self, fields: &[MutationField]) -> EntityPatch {
        let mut patch = self;
        for field in fields {
            match (&mut patch, field) {
                (EntityPatch::Post(p), MutationField::Like) => {
                    p.likes = None;
                    p.liked_by_me = None;
                }
                (EntityPatch::Post(p), MutationField::Save) => p.saved_by_me = None,
                (EntityPatch::User(u), MutationField::Follow) => {
                    u.followers = None;
                    u.followed_by_me = None;
                }
                _ => {}
            }
        }
        patch
    }
}

/// A group of fields changed together by one toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationField {
    /// `liked_by_me` and `likes`.
    Like,
    /// `saved_by_me`.
    Save,
    /// `followed_by_me` and `followers`.
    Follow,
}

impl MutationField {
    pub const ALL: [MutationField; 3] =
        [MutationField::Like, MutationField::Save, MutationField::Follow];

    /// Kind of entity this field group lives on.
    pub fn kind(self) -> EntityKind {
        match self {
            MutationField::Like | MutationField::Save => EntityKind::Post,
            MutationField::Follow => EntityKind::User,
        }
    }
}

impl fmt::Display for MutationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationField::Like => f.write_str("like"),
            MutationField::Save => f.write_str("save"),
            MutationField::Follow => f.write_str("follow"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn likes(likes: u64, liked: bool) -> EntityPatch {
        EntityPatch::Post(PostPatch {
            likes: Some(likes),
            liked_by_me: Some(liked),
            ..Default::default()
        })
    }

    #[test]
    fn test_merge_keeps_unmentioned_fields() {
        let mut entity = Entity::new(
            "p1",
            EntityPatch::Post(PostPatch {
                title: Some("Hello".into()),
                comment_count: Some(2),
                ..Default::default()
            }),
        );
        entity.merge(likes(5, true));

        let post = entity.as_post().unwrap();
        assert_eq!(post.title.as_deref(), Some("Hello"));
        assert_eq!(post.comment_count, 2);
        assert_eq!(post.likes, 5);
        assert!(post.liked_by_me);
    }

    #[test]
    fn test_timestamps_are_set_once() {
        let first = Utc::now();
        let later = first + chrono::Duration::hours(1);
        let mut entity = Entity::new(
            "p1",
            EntityPatch::Post(PostPatch {
                created_at: Some(first),
                ..Default::default()
            }),
        );
        entity.merge(EntityPatch::Post(PostPatch {
            created_at: Some(later),
            updated_at: Some(later),
            ..Default::default()
        }));

        let post = entity.as_post().unwrap();
        assert_eq!(post.created_at, Some(first));
        assert_eq!(post.updated_at, Some(later));
    }

    #[test]
    fn test_other_kind_is_ignored() {
        let mut entity = Entity::new("u1", EntityPatch::User(UserPatch::default()));
        entity.merge(likes(9, true));
        assert_eq!(entity.kind(), EntityKind::User);
        assert_eq!(entity.as_user().unwrap().followers, 0);
    }

    #[test]
    fn test_capture_inverts_patch() {
        let mut entity = Entity::new("p1", likes(3, false));
        let optimistic = likes(4, true);
        let inverse = optimistic.capture(&entity);
        assert_eq!(inverse, likes(3, false));

        entity.merge(optimistic);
        entity.merge(inverse);
        assert_eq!(entity, Entity::new("p1", likes(3, false)));
    }

    #[test]
    fn test_overlay_prefers_newer() {
        let confirmed = likes(4, true).overlay(EntityPatch::Post(PostPatch {
            likes: Some(10),
            ..Default::default()
        }));
        assert_eq!(confirmed, likes(10, true));
    }

    #[test]
    fn test_without_strips_field_group() {
        let patch = EntityPatch::Post(PostPatch {
            title: Some("t".into()),
            likes: Some(1),
            liked_by_me: Some(true),
            saved_by_me: Some(true),
            ..Default::default()
        })
        .without(&[MutationField::Like]);

        assert_eq!(
            patch,
            EntityPatch::Post(PostPatch {
                title: Some("t".into()),
                saved_by_me: Some(true),
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_post_dto_conversion() {
        let dto: PostDto = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "code": "",
            "language": "rust",
            "likes": 2,
            "comments": [{}, {}, {}],
            "userMetadata": { "userId": "u1", "username": "ada" }
        }))
        .unwrap();

        let patch = PostPatch::from(dto);
        assert_eq!(patch.code, None);
        assert_eq!(patch.likes, Some(2));
        assert_eq!(patch.comment_count, Some(3));
        assert_eq!(patch.liked_by_me, None);
        assert_eq!(patch.author.unwrap().username.as_deref(), Some("ada"));
    }
}
