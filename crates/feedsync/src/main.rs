//! feedsync: terminal client for the social coding feed
//!
//! Subcommands:
//! - `feed`, `profile`, `saved`, `search`, `following`: page through a feed
//! - `like`, `save`, `follow`: optimistic toggles
//! - `post`: publish a post
//! - `comment`, `comments`: post a comment (with an optional code snippet), list comments
//! - `notifications`: print the notification list, optionally staying live

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use feedsync_engine::{FeedKind, Session, SyncConfig};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "feedsync")]
#[command(about = "Feed, toggles and notifications from the terminal", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Print entities as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Posts service base URL
    #[arg(long, env = "FEEDSYNC_POSTS_URL", global = true)]
    posts_url: Option<String>,

    /// Users service base URL
    #[arg(long, env = "FEEDSYNC_USERS_URL", global = true)]
    users_url: Option<String>,

    /// Notifications service base URL
    #[arg(long, env = "FEEDSYNC_NOTIFICATIONS_URL", global = true)]
    notifications_url: Option<String>,

    /// Bearer token of the signed-in user
    #[arg(long, env = "FEEDSYNC_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Items per feed page
    #[arg(long, env = "FEEDSYNC_PAGE_SIZE", global = true)]
    page_size: Option<u32>,
}

impl ConnectionArgs {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        if let Some(url) = &self.posts_url {
            config.posts_url = url.clone();
        }
        if let Some(url) = &self.users_url {
            config.users_url = url.clone();
        }
        if let Some(url) = &self.notifications_url {
            config.notifications_url = url.clone();
        }
        if let Some(page_size) = self.page_size.filter(|n| *n > 0) {
            config.page_size = page_size;
        }
        config
    }

    fn session(&self) -> Result<Session> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| miette::miette!("no token: pass --token or set FEEDSYNC_TOKEN"))?;
        Session::from_bearer(token).into_diagnostic()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Global feed, newest first
    Feed {
        /// Pages to load
        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Posts by one user
    Profile {
        user_id: String,

        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Your saved posts
    Saved {
        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Search users by name
    Search {
        query: String,

        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Users someone follows (default: you)
    Following {
        user_id: Option<String>,

        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Like or unlike a post
    Like { post_id: String },

    /// Save or unsave a post
    Save { post_id: String },

    /// Follow or unfollow a user
    Follow { user_id: String },

    /// Publish a post
    Post {
        title: String,

        /// Post body
        content: String,

        /// File holding a code snippet to attach
        #[arg(long)]
        code: Option<PathBuf>,

        /// Language of the snippet
        #[arg(long, requires = "code")]
        language: Option<String>,
    },

    /// List the comments on a post
    Comments { post_id: String },

    /// Comment on a post
    Comment {
        post_id: String,

        /// Comment text
        text: String,

        /// File holding a code snippet to attach
        #[arg(long)]
        code: Option<PathBuf>,

        /// Language of the snippet
        #[arg(long, requires = "code")]
        language: Option<String>,
    },

    /// List notifications
    Notifications {
        /// Stay connected and print new notifications until interrupted
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "feedsync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let session = cli.connection.session()?;
    let sync = commands::connect(session, cli.connection.config())?;
    let out = commands::Output { json: cli.json };

    match cli.command {
        Commands::Feed { pages } => commands::list(&sync, &out, FeedKind::Global, pages).await,
        Commands::Profile { user_id, pages } => {
            commands::list(&sync, &out, FeedKind::Profile(user_id), pages).await
        }
        Commands::Saved { pages } => {
            let viewer = sync.session().current_user_id.clone();
            commands::list(&sync, &out, FeedKind::Saved(viewer), pages).await
        }
        Commands::Search { query, pages } => {
            commands::list(&sync, &out, FeedKind::SearchUsers(query), pages).await
        }
        Commands::Following { user_id, pages } => {
            let user_id = user_id.unwrap_or_else(|| sync.session().current_user_id.clone());
            commands::list(&sync, &out, FeedKind::Following(user_id), pages).await
        }
        Commands::Like { post_id } => commands::like(&sync, &out, &post_id).await,
        Commands::Save { post_id } => commands::save(&sync, &out, &post_id).await,
        Commands::Follow { user_id } => commands::follow(&sync, &out, &user_id).await,
        Commands::Post {
            title,
            content,
            code,
            language,
        } => commands::post(&sync, &out, title, content, code, language).await,
        Commands::Comments { post_id } => commands::comments(&sync, &out, &post_id).await,
        Commands::Comment {
            post_id,
            text,
            code,
            language,
        } => commands::comment(&sync, &post_id, text, code, language).await,
        Commands::Notifications { follow } => commands::notifications(&sync, &out, follow).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_post_language_needs_code() {
        let parsed = Cli::try_parse_from(["feedsync", "post", "t", "body", "--language", "rust"]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from([
            "feedsync", "post", "t", "body", "--code", "a.rs", "--language", "rust",
        ])
        .unwrap();
        match cli.command {
            Commands::Post { code, language, .. } => {
                assert_eq!(code, Some(PathBuf::from("a.rs")));
                assert_eq!(language.as_deref(), Some("rust"));
            }
            _ => panic!("expected post"),
        }
    }

    #[test]
    fn test_following_defaults_to_viewer() {
        let cli = Cli::try_parse_from(["feedsync", "following"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Following { user_id: None, pages: 1 }
        ));

        let cli = Cli::try_parse_from(["feedsync", "comments", "p1", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Comments { post_id } if post_id == "p1"));
    }
}
