//! Subcommand implementations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedsync_engine::{
    CommentDraft, Entity, FeedKind, FeedSync, LoadOutcome, MutationOutcome, NotificationEvent,
    PostDraft, Session, StreamState, SyncConfig,
};
use miette::{IntoDiagnostic, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How results are printed.
pub struct Output {
    pub json: bool,
}

impl Output {
    fn entity(&self, entity: &Entity) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(entity).into_diagnostic()?);
            return Ok(());
        }
        match entity {
            Entity::Post(post) => {
                let author = post
                    .author
                    .as_ref()
                    .and_then(|a| a.username.clone().or_else(|| a.name.clone()))
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{}  {}  by {}  [{} {}] [{} comments]{}",
                    post.id,
                    post.title.as_deref().unwrap_or("(untitled)"),
                    author,
                    post.likes,
                    if post.liked_by_me { "liked" } else { "likes" },
                    post.comment_count,
                    if post.saved_by_me { " [saved]" } else { "" },
                );
            }
            Entity::User(user) => {
                println!(
                    "{}  {}  {} followers{}",
                    user.id,
                    user.username.as_deref().or(user.name.as_deref()).unwrap_or("?"),
                    user.followers,
                    if user.followed_by_me { " [following]" } else { "" },
                );
            }
        }
        Ok(())
    }

    fn notification(&self, event: &NotificationEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode notification"),
            }
            return;
        }
        let related = event
            .related_post_id
            .as_deref()
            .map(|id| format!("  (post {})", id))
            .unwrap_or_default();
        println!(
            "{}  {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M"),
            event.message,
            related
        );
    }

    fn outcome(&self, what: &str, outcome: &MutationOutcome) {
        match outcome {
            MutationOutcome::Committed => info!("{} confirmed", what),
            MutationOutcome::RolledBack(e) => warn!(error = %e, "{} rejected, reverted", what),
            MutationOutcome::Stale => warn!("{} abandoned", what),
        }
    }
}

pub fn connect(session: Session, config: SyncConfig) -> Result<FeedSync> {
    debug!(user_id = %session.current_user_id, posts_url = %config.posts_url, "connecting");
    FeedSync::connect(session, config).into_diagnostic()
}

/// Load up to `pages` pages of a feed and print it.
pub async fn list(sync: &FeedSync, out: &Output, kind: FeedKind, pages: u32) -> Result<()> {
    let feed = sync.feed(kind);
    for _ in 0..pages {
        match feed.load_next().await.into_diagnostic()? {
            LoadOutcome::Loaded { added, exhausted } => {
                debug!(added = added.len(), exhausted, "page loaded");
                if exhausted {
                    break;
                }
            }
            LoadOutcome::Exhausted => break,
            LoadOutcome::AlreadyLoading | LoadOutcome::Discarded => {}
        }
    }

    // The listings do not say what the viewer saved or follows.
    let viewer = &sync.session().current_user_id;
    let ids = feed.ids();
    let reconciled = match feed.kind() {
        FeedKind::Saved(owner) | FeedKind::Following(owner) if owner == viewer => Ok(()),
        FeedKind::SearchUsers(_) | FeedKind::Following(_) => sync.reconcile_following(&ids).await,
        _ => sync.reconcile_saved(&ids).await,
    };
    if let Err(e) = reconciled {
        warn!(error = %e, "could not reconcile viewer state");
    }

    let view = sync.view();
    for entity in view.project(&feed) {
        out.entity(&entity)?;
    }
    if feed.ids().is_empty() {
        info!("nothing to show");
    }
    Ok(())
}

pub async fn like(sync: &FeedSync, out: &Output, post_id: &str) -> Result<()> {
    sync.open_post(post_id).await.into_diagnostic()?;
    sync.refresh_like_state(post_id).await.into_diagnostic()?;
    let outcome = sync.toggle_like(post_id).await.into_diagnostic()?;
    out.outcome("like", &outcome);
    print_cached(sync, out, post_id)
}

pub async fn save(sync: &FeedSync, out: &Output, post_id: &str) -> Result<()> {
    sync.open_post(post_id).await.into_diagnostic()?;
    sync.refresh_saved_state(post_id).await.into_diagnostic()?;
    let outcome = sync.toggle_save(post_id).await.into_diagnostic()?;
    out.outcome("save", &outcome);
    print_cached(sync, out, post_id)
}

pub async fn follow(sync: &FeedSync, out: &Output, user_id: &str) -> Result<()> {
    sync.open_user(user_id).await.into_diagnostic()?;
    sync.refresh_follow_state(user_id).await.into_diagnostic()?;
    let outcome = sync.toggle_follow(user_id).await.into_diagnostic()?;
    out.outcome("follow", &outcome);
    print_cached(sync, out, user_id)
}

pub async fn comment(
    sync: &FeedSync,
    post_id: &str,
    text: String,
    code: Option<PathBuf>,
    language: Option<String>,
) -> Result<()> {
    let code = read_snippet(code.as_deref()).await?;
    sync.open_post(post_id).await.into_diagnostic()?;

    let draft = CommentDraft {
        content: text,
        code,
        language: language.unwrap_or_default(),
    };
    let created = sync.submit_comment(post_id, draft).await.into_diagnostic()?;
    let post = sync.cache().get_post(post_id).into_diagnostic()?;
    info!(
        comment_id = %created.id,
        comments = post.comment_count,
        "comment posted"
    );
    Ok(())
}

/// Publish a post and show it.
pub async fn post(
    sync: &FeedSync,
    out: &Output,
    title: String,
    content: String,
    code: Option<PathBuf>,
    language: Option<String>,
) -> Result<()> {
    let draft = PostDraft {
        title,
        content,
        code: read_snippet(code.as_deref()).await?,
        language: language.unwrap_or_default(),
        images: Vec::new(),
    };
    let global = sync.feed(FeedKind::Global);
    let post = sync.create_post(draft, &[&global]).await.into_diagnostic()?;
    print_cached(sync, out, &post.id)
}

/// Print the comments on a post.
pub async fn comments(sync: &FeedSync, out: &Output, post_id: &str) -> Result<()> {
    let comments = sync.comments(post_id).await.into_diagnostic()?;
    for comment in &comments {
        let author = comment
            .user_metadata
            .as_ref()
            .map(|m| m.username.clone().unwrap_or_else(|| m.user_id.clone()))
            .unwrap_or_else(|| "?".to_string());
        if out.json {
            let line = serde_json::json!({
                "id": comment.id,
                "author": author,
                "content": comment.content,
                "code": comment.code,
                "language": comment.language,
                "createdAt": comment.created_at,
            });
            println!("{}", line);
            continue;
        }
        println!(
            "{}  {}: {}",
            comment.id,
            author,
            comment.content.as_deref().unwrap_or("")
        );
        if let Some(code) = comment.code.as_deref().filter(|c| !c.trim().is_empty()) {
            println!("    [{}]", comment.language.as_deref().unwrap_or("code"));
            for line in code.lines() {
                println!("    {}", line);
            }
        }
    }
    if comments.is_empty() {
        info!("no comments");
    }
    Ok(())
}

/// Print the notification list. With `follow`, stay connected and print each
/// new notification until ctrl-c.
pub async fn notifications(sync: &FeedSync, out: &Output, follow: bool) -> Result<()> {
    let stream = Arc::new(sync.notifications(sync.hub_transport()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Registered before connecting so nothing admitted before the list prints is lost.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    stream.on_new_event(move |event| {
        let _ = events_tx.send(event.clone());
    });

    let mut runner = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move { stream.run(shutdown_rx).await })
    };

    let mut state = stream.watch_state();
    tokio::select! {
        live = state.wait_for(|s| *s == StreamState::Live) => {
            live.into_diagnostic()?;
        }
        result = &mut runner => {
            // the stream gave up before it ever went live
            result.into_diagnostic()?.into_diagnostic()?;
            return Ok(());
        }
    }

    let listed = stream.current_list();
    for event in &listed {
        out.notification(event);
    }

    if !follow {
        let _ = shutdown_tx.send(true);
        return runner.await.into_diagnostic()?.into_diagnostic();
    }

    let shown: HashSet<String> = listed.into_iter().map(|event| event.id).collect();
    let json = out.json;
    let printer = tokio::spawn(async move {
        let out = Output { json };
        while let Some(event) = events_rx.recv().await {
            if !shown.contains(&event.id) {
                out.notification(&event);
            }
        }
    });

    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown.send(true);
    });

    let result = runner.await;
    printer.abort();
    result.into_diagnostic()?.into_diagnostic()
}

/// Read a code snippet file, or nothing.
async fn read_snippet(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e)),
        None => Ok(String::new()),
    }
}

fn print_cached(sync: &FeedSync, out: &Output, id: &str) -> Result<()> {
    match sync.cache().get(id) {
        Some(entity) => out.entity(&entity),
        None => {
            warn!(id = %id, "entity left the cache");
            Ok(())
        }
    }
}
