//! Engine configuration.

use std::time::Duration;

use backoff::ExponentialBackoff;
use feedsync_api::Endpoints;
use serde::Deserialize;

/// Default page size for feed listings.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Configuration for a [`FeedSync`](crate::FeedSync) instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub posts_url: String,
    pub users_url: String,
    pub notifications_url: String,
    /// Items requested per feed page.
    pub page_size: u32,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let endpoints = Endpoints::default();
        Self {
            posts_url: endpoints.posts,
            users_url: endpoints.users,
            notifications_url: endpoints.notifications,
            page_size: DEFAULT_PAGE_SIZE,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Service endpoints for the REST client.
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            posts: self.posts_url.clone(),
            users: self.users_url.clone(),
            notifications: self.notifications_url.clone(),
        }
    }
}

/// Notification reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Backoff schedule for the reconnect loop.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None, // the attempt ceiling bounds retries instead
            ..Default::default()
        };
        backoff.current_interval = backoff.initial_interval;
        backoff
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
