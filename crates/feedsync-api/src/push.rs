//! Push channel for notifications.
//!
//! Connects to the notification hub over WebSocket, speaks the SignalR JSON
//! protocol, and yields the notification payloads delivered to the
//! `NotificationsReceived` client method. Reconnection is the caller's job.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::signalr::{self, HubMessage};
use crate::{ApiError, NotificationDto};

/// Hub method the server invokes for each new notification.
pub const NOTIFICATION_TARGET: &str = "NotificationsReceived";

/// Path of the notification hub on the notifications service.
pub const HUB_PATH: &str = "/hubs/notification";

const READ_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the notification hub.
#[derive(Debug, Clone)]
pub struct HubClient {
    url: String,
    token: Option<String>,
    read_timeout: Duration,
    keepalive_interval: Duration,
}

impl HubClient {
    /// Create a client for a full `ws://` / `wss://` hub URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            read_timeout: READ_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    /// Derive the hub URL from the notifications service HTTP base URL.
    pub fn from_service_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self::new(format!("{}{}", ws, HUB_PATH))
    }

    /// Attach the bearer token (sent as `access_token`, as browsers must).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Override how long the hub may stay silent and how often we ping it.
    pub fn with_timeouts(mut self, read_timeout: Duration, keepalive_interval: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.keepalive_interval = keepalive_interval;
        self
    }

    /// The hub URL without credentials.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn connect_url(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}access_token={}", self.url, sep, token)
            }
            None => self.url.clone(),
        }
    }

    /// Open the socket and complete the hub handshake.
    pub async fn connect(&self) -> Result<HubSubscription, ApiError> {
        let (mut socket, _) = connect_async(self.connect_url())
            .await
            .map_err(|e| ApiError::WebSocket(format!("connection failed: {}", e)))?;

        socket
            .send(Message::Text(signalr::handshake_request()))
            .await
            .map_err(|e| ApiError::WebSocket(format!("handshake send failed: {}", e)))?;

        // The handshake response may share a frame with the first messages.
        let mut pending = VecDeque::new();
        loop {
            let frame = tokio::time::timeout(self.read_timeout, socket.next())
                .await
                .map_err(|_| ApiError::WebSocket("handshake timeout".to_string()))?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let mut records = signalr::split_records(&text);
                    let Some(first) = records.next() else {
                        continue;
                    };
                    signalr::check_handshake(first)?;
                    pending.extend(records.map(str::to_string));
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ApiError::WebSocket("closed during handshake".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(ApiError::WebSocket(format!("handshake read failed: {}", e)));
                }
            }
        }

        info!(url = %self.url, "notification hub connected");

        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(HubSubscription {
            socket,
            pending,
            keepalive,
            read_timeout: self.read_timeout,
            read_deadline: Instant::now() + self.read_timeout,
        })
    }
}

/// An established hub connection.
pub struct HubSubscription {
    socket: Socket,
    pending: VecDeque<String>,
    keepalive: Interval,
    read_timeout: Duration,
    /// Reset by every frame from the hub; our own pings do not count.
    read_deadline: Instant,
}

impl HubSubscription {
    /// Wait for the next notification.
    ///
    /// Returns `None` when the hub closes the connection cleanly. Payloads that
    /// fail to decode are reported as errors without ending the subscription.
    pub async fn next_notification(&mut self) -> Option<Result<NotificationDto, ApiError>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                match signalr::parse_message(&record) {
                    Ok(HubMessage::Invocation { target, arguments }) => {
                        if target != NOTIFICATION_TARGET {
                            trace!(target = %target, "ignoring hub invocation");
                            continue;
                        }
                        let Some(payload) = arguments.into_iter().next() else {
                            return Some(Err(ApiError::Protocol(
                                "notification invocation without arguments".to_string(),
                            )));
                        };
                        return Some(serde_json::from_value(payload).map_err(ApiError::from));
                    }
                    Ok(HubMessage::Ping) => trace!("hub ping"),
                    Ok(HubMessage::Close {
                        error,
                        allow_reconnect,
                    }) => {
                        info!(error = ?error, allow_reconnect, "hub closed connection");
                        return match error {
                            Some(error) => Some(Err(ApiError::WebSocket(format!(
                                "closed by hub: {}",
                                error
                            )))),
                            None => None,
                        };
                    }
                    Ok(HubMessage::Other(kind)) => trace!(kind, "ignoring hub message"),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            tokio::select! {
                _ = self.keepalive.tick() => {
                    if let Err(e) = self.socket.send(Message::Text(signalr::ping_record())).await {
                        return Some(Err(ApiError::WebSocket(format!("keepalive failed: {}", e))));
                    }
                }
                _ = tokio::time::sleep_until(self.read_deadline) => {
                    warn!(timeout_ms = self.read_timeout.as_millis() as u64, "hub read timeout");
                    return Some(Err(ApiError::WebSocket("read timeout".to_string())));
                }
                frame = self.socket.next() => {
                    self.read_deadline = Instant::now() + self.read_timeout;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.pending.extend(signalr::split_records(&text).map(str::to_string));
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!("hub socket closed");
                            return Some(Err(ApiError::WebSocket("connection closed".to_string())));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Some(Err(ApiError::WebSocket(format!("read error: {}", e))));
                        }
                        None => {
                            return Some(Err(ApiError::WebSocket("stream ended".to_string())));
                        }
                    }
                }
            }
        }
    }

    /// Turn the subscription into a stream of notifications.
    ///
    /// The stream ends after the first connection-level error; decode errors
    /// of single payloads are yielded and skipped over.
    pub fn into_stream(self) -> BoxStream<'static, Result<NotificationDto, ApiError>> {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut sub = state?;
            match sub.next_notification().await {
                None => None,
                Some(Err(e)) if e.is_malformed() => Some((Err(e), Some(sub))),
                Some(Err(e)) => Some((Err(e), None)),
                Some(Ok(n)) => Some((Ok(n), Some(sub))),
            }
        })
        .boxed()
    }
}
