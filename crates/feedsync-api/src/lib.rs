//! Client for the feed backend services.
//!
//! This crate talks to the three services the feed engine depends on:
//!
//! - **REST client**: paged post and user listings, likes, saves, follows and comments
//! - **Push hub**: SignalR WebSocket subscription delivering new notifications
//! - **Wire types**: lenient DTOs for the backend's JSON shapes

mod client;
mod error;
pub mod push;
pub mod signalr;
mod types;

pub use client::{Endpoints, FeedApiClient};
pub use error::ApiError;
pub use push::{HUB_PATH, HubClient, HubSubscription, NOTIFICATION_TARGET};
pub use types::{
    CommentDto, LikeDto, NewComment, NewPost, NotificationDto, Page, PostDto, ToggleAck, UserDto,
    UserMetadata,
};
