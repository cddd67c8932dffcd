//! Live notification log.
//!
//! Keeps a push subscription open, merges it with a REST snapshot taken on
//! every (re)connect, and exposes one deduplicated list ordered newest first.
//!
//! State machine: `Disconnected -> Connecting -> Live -> Disconnected`. A
//! dropped connection goes back through `Connecting` after an exponential
//! backoff; only an explicit shutdown (or the optional attempt ceiling) ends
//! the loop.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use feedsync_api::{ApiError, NotificationDto};
use futures_util::StreamExt;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{FeedBackend, PushTransport};
use crate::config::ReconnectConfig;
use crate::error::SyncError;

static RELATED_POST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(liked your post|commented on your post) (\w+)").unwrap());

/// Post id named by a notification message, e.g. "ada liked your post 42".
pub fn related_post_from_message(message: &str) -> Option<String> {
    RELATED_POST_RE
        .captures(message)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// One notification. Never mutated once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub id: String,
    pub message: String,
    pub related_post_id: Option<String>,
    pub sender_id: String,
    pub sender_image_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<NotificationDto> for NotificationEvent {
    fn from(dto: NotificationDto) -> Self {
        let related_post_id = dto
            .post_id
            .filter(|id| !id.is_empty())
            .or_else(|| related_post_from_message(&dto.message));
        Self {
            id: dto.id,
            message: dto.message,
            related_post_id,
            sender_id: dto.sender_user_id,
            sender_image_url: dto.image_url,
            timestamp: dto.timestamp,
        }
    }
}

/// Newest first; equal timestamps by ascending id.
fn display_order(a: &NotificationEvent, b: &NotificationEvent) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

/// Connection state of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Live,
}

#[derive(Default)]
struct NotificationLog {
    events: Vec<NotificationEvent>,
    ids: HashSet<String>,
}

impl NotificationLog {
    fn insert(&mut self, event: NotificationEvent) -> bool {
        if !self.ids.insert(event.id.clone()) {
            return false;
        }
        let pos = self
            .events
            .partition_point(|existing| display_order(existing, &event) == Ordering::Less);
        self.events.insert(pos, event);
        true
    }
}

type Listener = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

/// Deduplicated, ordered notification log fed by push and snapshot.
pub struct NotificationStream {
    viewer_id: String,
    backend: Arc<dyn FeedBackend>,
    transport: Arc<dyn PushTransport>,
    reconnect: ReconnectConfig,
    log: Mutex<NotificationLog>,
    listeners: Mutex<Vec<Listener>>,
    state_tx: watch::Sender<StreamState>,
}

impl NotificationStream {
    pub fn new(
        viewer_id: impl Into<String>,
        backend: Arc<dyn FeedBackend>,
        transport: Arc<dyn PushTransport>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Disconnected);
        Self {
            viewer_id: viewer_id.into(),
            backend,
            transport,
            reconnect,
            log: Mutex::new(NotificationLog::default()),
            listeners: Mutex::new(Vec::new()),
            state_tx,
        }
    }

    /// Every admitted notification, newest first.
    pub fn current_list(&self) -> Vec<NotificationEvent> {
        self.log.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a callback fired once per newly admitted notification, in
    /// the order notifications were received.
    ///
    /// Snapshot entries loaded by the first connection are not "new"; entries
    /// a later snapshot reveals (missed while disconnected) are.
    pub fn on_new_event(&self, callback: impl Fn(&NotificationEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(callback));
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Drop every admitted notification.
    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.events.clear();
        log.ids.clear();
    }

    fn set_state(&self, state: StreamState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            trace!(from = ?*current, to = ?state, "notification stream state");
            *current = state;
            true
        });
    }

    /// Admit notifications, skipping self-echoes and known ids.
    fn admit(&self, batch: Vec<NotificationDto>) -> Vec<NotificationEvent> {
        let mut log = self.log.lock();
        let mut admitted = Vec::new();
        for dto in batch {
            if dto.sender_user_id == self.viewer_id {
                trace!(id = %dto.id, "dropping notification sent by the viewer");
                continue;
            }
            let event = NotificationEvent::from(dto);
            if log.insert(event.clone()) {
                admitted.push(event);
            } else {
                trace!(id = %event.id, "dropping duplicate notification");
            }
        }
        admitted
    }

    fn emit(&self, events: &[NotificationEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    /// Connect and keep the log live until shutdown.
    ///
    /// Shutdown is signalled by sending `true` (or dropping the sender).
    /// Returns [`SyncError::RetriesExhausted`] once the configured number of
    /// consecutive connection failures is reached.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut backoff = self.reconnect.backoff();
        let mut failures = 0u32;
        let mut was_live = false;

        loop {
            if *shutdown_rx.borrow() {
                info!("notification stream shutting down");
                self.set_state(StreamState::Disconnected);
                return Ok(());
            }

            match self
                .connect_and_process(&mut shutdown_rx, &mut backoff, &mut failures, &mut was_live)
                .await
            {
                Ok(()) => {
                    info!("notification stream shut down");
                    self.set_state(StreamState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    self.set_state(StreamState::Disconnected);
                    failures += 1;

                    if let Some(max) = self.reconnect.max_attempts
                        && failures >= max
                    {
                        error!(attempts = failures, error = %e, "notification stream giving up");
                        return Err(SyncError::RetriesExhausted {
                            attempts: failures,
                            last: e,
                        });
                    }

                    let wait = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.reconnect.max_backoff());
                    warn!(
                        attempt = failures,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "notification connection lost, reconnecting"
                    );

                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// One connection: handshake, snapshot merge, then live events until the
    /// connection drops (`Err`) or shutdown (`Ok`).
    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
        failures: &mut u32,
        was_live: &mut bool,
    ) -> Result<(), ApiError> {
        self.set_state(StreamState::Connecting);
        let mut push = self.transport.connect().await?;

        // Push events that arrive before the snapshot are held back and merged after it.
        let snapshot = self.backend.notification_snapshot(&self.viewer_id);
        tokio::pin!(snapshot);
        let mut buffered = Vec::new();
        let snapshot = loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                result = &mut snapshot => break result?,
                item = push.next() => match item {
                    Some(Ok(dto)) => buffered.push(dto),
                    Some(Err(e)) if e.is_malformed() => {
                        warn!(error = %e, "dropping malformed push payload");
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ApiError::WebSocket(
                            "push stream ended during connect".to_string(),
                        ));
                    }
                },
            }
        };

        backoff.reset();
        *failures = 0;

        let from_snapshot = self.admit(snapshot);
        if *was_live {
            self.emit(&from_snapshot);
        }
        *was_live = true;
        let from_push = self.admit(buffered);
        self.emit(&from_push);
        // Live means the snapshot is merged.
        self.set_state(StreamState::Live);
        info!(
            snapshot_new = from_snapshot.len(),
            buffered_new = from_push.len(),
            total = self.len(),
            "notification stream live"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("notification stream received shutdown signal");
                        return Ok(());
                    }
                }
                item = push.next() => match item {
                    Some(Ok(dto)) => {
                        debug!(id = %dto.id, "push notification received");
                        let admitted = self.admit(vec![dto]);
                        self.emit(&admitted);
                    }
                    Some(Err(e)) if e.is_malformed() => {
                        warn!(error = %e, "dropping malformed push payload");
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(ApiError::WebSocket("push stream ended".to_string())),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeTransport, notification};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    fn policy(max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            max_attempts,
        }
    }

    fn ids(events: &[NotificationEvent]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    struct Harness {
        stream: Arc<NotificationStream>,
        backend: Arc<FakeBackend>,
        transport: Arc<FakeTransport>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    fn harness(max_attempts: Option<u32>) -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let transport = Arc::new(FakeTransport::default());
        let stream = Arc::new(NotificationStream::new(
            "me",
            backend.clone(),
            transport.clone(),
            policy(max_attempts),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        stream.on_new_event(move |event| sink.lock().push(event.id.clone()));
        Harness {
            stream,
            backend,
            transport,
            seen,
        }
    }

    #[test]
    fn test_related_post_extraction() {
        assert_eq!(
            related_post_from_message("ada liked your post 65f1c2"),
            Some("65f1c2".to_string())
        );
        assert_eq!(
            related_post_from_message("bob commented on your post p_9: nice"),
            Some("p_9".to_string())
        );
        assert_eq!(related_post_from_message("carol started following you"), None);
    }

    #[test]
    fn test_log_orders_newest_first_ties_by_id() {
        let mut log = NotificationLog::default();
        for (id, secs) in [("b", 5), ("c", 9), ("a", 5)] {
            assert!(log.insert(NotificationEvent::from(notification(id, "x", secs))));
        }
        assert!(!log.insert(NotificationEvent::from(notification("a", "x", 100))));
        assert_eq!(ids(&log.events), vec!["c", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_buffered_push_merge() {
        let h = harness(None);
        h.backend.push_snapshot(Ok(vec![
            notification("n1", "ada", 10),
            notification("n0", "me", 1),
        ]));
        let push = h.transport.accept();
        push.send(Ok(notification("n1", "ada", 10))).unwrap();
        push.send(Ok(notification("n2", "me", 30))).unwrap();
        push.send(Ok(notification("n3", "bob", 20))).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = Arc::clone(&h.stream);
        let task = tokio::spawn(async move { stream.run(shutdown_rx).await });

        eventually(|| h.stream.len() == 2).await;
        assert_eq!(ids(&h.stream.current_list()), vec!["n3", "n1"]);
        assert_eq!(*h.seen.lock(), vec!["n3".to_string()]);
        assert_eq!(h.stream.state(), StreamState::Live);
        assert_eq!(
            h.stream.current_list()[1].related_post_id.as_deref(),
            Some("pn1")
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(h.stream.state(), StreamState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_push_fires_in_receipt_order() {
        let h = harness(None);
        let push = h.transport.accept();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = Arc::clone(&h.stream);
        let task = tokio::spawn(async move { stream.run(shutdown_rx).await });

        let mut state = h.stream.watch_state();
        state.wait_for(|s| *s == StreamState::Live).await.unwrap();

        push.send(Ok(notification("late", "ada", 1))).unwrap();
        push.send(Ok(notification("early", "bob", 50))).unwrap();
        push.send(Ok(notification("late", "ada", 1))).unwrap();
        eventually(|| h.seen.lock().len() == 2).await;

        assert_eq!(*h.seen.lock(), vec!["late".to_string(), "early".to_string()]);
        assert_eq!(ids(&h.stream.current_list()), vec!["early", "late"]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_admits_missed_snapshot_entries() {
        let h = harness(None);
        h.backend.push_snapshot(Ok(vec![notification("n1", "ada", 10)]));
        h.backend
            .push_snapshot(Ok(vec![notification("n1", "ada", 10), notification("n2", "bob", 20)]));
        let first = h.transport.accept();
        let _second = h.transport.accept();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = Arc::clone(&h.stream);
        let task = tokio::spawn(async move { stream.run(shutdown_rx).await });

        let mut state = h.stream.watch_state();
        state.wait_for(|s| *s == StreamState::Live).await.unwrap();
        assert!(h.seen.lock().is_empty());

        drop(first);
        eventually(|| h.stream.len() == 2).await;

        assert_eq!(*h.seen.lock(), vec!["n2".to_string()]);
        assert_eq!(h.transport.connects.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(h.backend.snapshot_calls.load(AtomicOrdering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_ceiling() {
        let h = harness(Some(3));
        h.transport.refuse();
        h.transport.refuse();
        h.transport.refuse();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = h.stream.run(shutdown_rx).await;

        assert!(matches!(
            result,
            Err(SyncError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(h.transport.connects.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(h.stream.state(), StreamState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshot_triggers_reconnect() {
        let h = harness(None);
        h.backend.push_snapshot(Err(crate::testing::rejected()));
        h.backend.push_snapshot(Ok(vec![notification("n1", "ada", 1)]));
        let _first = h.transport.accept();
        let _second = h.transport.accept();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = Arc::clone(&h.stream);
        let task = tokio::spawn(async move { stream.run(shutdown_rx).await });

        eventually(|| h.stream.len() == 1).await;
        assert_eq!(h.transport.connects.load(AtomicOrdering::SeqCst), 2);
        // first successful connection: snapshot entries are not new events
        assert!(h.seen.lock().is_empty());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_clear() {
        let h = harness(None);
        h.stream.admit(vec![notification("n1", "ada", 1)]);
        assert_eq!(h.stream.len(), 1);
        h.stream.clear();
        assert!(h.stream.is_empty());
        // cleared ids may be admitted again
        assert_eq!(h.stream.admit(vec![notification("n1", "ada", 1)]).len(), 1);
    }
}
