//! Persistent session to the cloud coordination service's event socket.
//!
//! [`CloudLink`] keeps one socket alive with its own backoff (unlimited
//! retries by default), offers fire-and-forget [`emit`](CloudLink::emit)
//! and acknowledged [`emit_with_callback`](CloudLink::emit_with_callback),
//! and dispatches inbound events to handlers registered with
//! [`on`](CloudLink::on). An idle watchdog tears the whole session down
//! and reconnects when the socket goes silent.

mod envelope;
mod handlers;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use self::handlers::{AckResponder, EventHandler, HandlerId, InboundEvent};
use self::envelope::Frame;
use self::handlers::HandlerRegistry;
use crate::backoff::{ReconnectConfig, calculate_backoff};
use crate::error::Error;
use crate::pending::PendingRequests;
use crate::transport;

const MAX_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

// ── ConnectionState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Only reachable with a bounded reconnect policy.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CloudLinkConfig {
    /// Event-socket URL (`ws(s)://` or `http(s)://`).
    pub url: Url,
    /// Sent as `Authorization: Bearer …` on the upgrade request.
    pub token: SecretString,
    /// Sent as `X-Agent-Id` on the upgrade request.
    pub agent_id: String,
    /// Reconnect when nothing arrives for this long. Default: 45s.
    pub idle_timeout: Duration,
    /// Bound on TCP + TLS + upgrade. Default: 10s.
    pub connect_timeout: Duration,
    /// Default: unlimited retries, 1s initial, 60s cap.
    pub reconnect: ReconnectConfig,
}

impl CloudLinkConfig {
    pub fn new(url: Url, token: SecretString, agent_id: impl Into<String>) -> Self {
        Self {
            url,
            token,
            agent_id: agent_id.into(),
            idle_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig {
                max_delay: Duration::from_secs(60),
                ..ReconnectConfig::default()
            },
        }
    }
}

// ── CloudLink ────────────────────────────────────────────────────────

/// Handle to the cloud session. Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct CloudLink {
    inner: Arc<CloudInner>,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct CloudInner {
    config: CloudLinkConfig,
    ws_url: Url,
    state: watch::Sender<ConnectionState>,
    /// Bumped each time a session reaches `Connected`.
    sessions: watch::Sender<u64>,
    outbound: ArcSwapOption<mpsc::UnboundedSender<Message>>,
    acks: PendingRequests<Value>,
    next_ack: AtomicU64,
    handlers: HandlerRegistry,
    last_inbound: watch::Sender<Option<DateTime<Utc>>>,
    last_error: ArcSwapOption<Error>,
    cancel: CancellationToken,
    session: Mutex<Option<LoopHandle>>,
}

/// Why a session ended without a socket error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Idle,
}

impl CloudLink {
    pub fn new(config: CloudLinkConfig) -> Result<Self, Error> {
        let ws_url = transport::websocket_url(&config.url, None)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (last_inbound, _) = watch::channel(None);
        let (sessions, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(CloudInner {
                config,
                ws_url,
                state,
                sessions,
                outbound: ArcSwapOption::empty(),
                acks: PendingRequests::new(),
                next_ack: AtomicU64::new(1),
                handlers: HandlerRegistry::new(),
                last_inbound,
                last_error: ArcSwapOption::empty(),
                cancel: CancellationToken::new(),
                session: Mutex::new(None),
            }),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the session loop if it is not already running. Returns
    /// without waiting for the first connection; see
    /// [`wait_until_connected`](Self::wait_until_connected).
    pub async fn connect(&self) {
        let mut session = self.inner.session.lock().await;
        let running = session
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished());
        if running {
            return;
        }

        self.inner.last_error.store(None);
        self.inner.set_state(ConnectionState::Connecting);

        let cancel = self.inner.cancel.child_token();
        let task_inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            cloud_loop(task_inner, task_cancel).await;
        });
        *session = Some(LoopHandle { cancel, task });
    }

    /// Wait until the link is `Connected` or a new session has come up,
    /// up to `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Error> {
        let mut sessions = self.inner.sessions.subscribe();
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        let mut state_rx = self.inner.state.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                changed = sessions.changed() => changed.map_err(|_| Error::ConnectionClosed),
                failed = state_rx.wait_for(|s| *s == ConnectionState::Error) => match failed {
                    Ok(_) => Err(self.last_error().unwrap_or(Error::NotConnected)),
                    Err(_) => Err(Error::ConnectionClosed),
                },
            }
        })
        .await;

        waited.unwrap_or_else(|_| {
            Err(Error::Timeout {
                timeout_ms: transport::duration_ms(timeout),
            })
        })
    }

    /// Stop the session loop, reject outstanding acknowledgements, and go
    /// to `Disconnected`. Handlers stay registered.
    pub async fn disconnect(&self) {
        let handle = self.inner.session.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(error = %e, "cloud session task ended abnormally");
            }
        }
        self.inner.teardown();
        tracing::info!("cloud link disconnected");
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Count of sessions that reached `Connected`; changes once per
    /// reconnect even when the state watch coalesces the drop.
    pub fn session_watch(&self) -> watch::Receiver<u64> {
        self.inner.sessions.subscribe()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.inner.last_error.load_full().map(|e| (*e).clone())
    }

    /// Wall-clock time of the last inbound frame of any kind.
    pub fn last_inbound(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_inbound.borrow()
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Fire-and-forget. Dropped with [`Error::NotConnected`] when the link
    /// is down; never queued.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), Error> {
        let Some(outbound) = self.inner.connected_sender() else {
            tracing::debug!(event, "cloud link not connected, dropping emit");
            return Err(Error::NotConnected);
        };
        let text = envelope::encode_event(event, data, None)?;
        outbound.send(Message::text(text)).map_err(|_| {
            tracing::debug!(event, "cloud session closed, dropping emit");
            Error::NotConnected
        })
    }

    /// Emit and wait for the remote's acknowledgement.
    ///
    /// Rejects with [`Error::Timeout`] when no ack arrives in time, with
    /// [`Error::Remote`] when the ack reports `success: false`, and with
    /// [`Error::ConnectionClosed`] when the session drops first.
    pub async fn emit_with_callback(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let outbound = self.inner.connected_sender().ok_or(Error::NotConnected)?;
        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let text = envelope::encode_event(event, data, Some(id))?;

        let rx = self.inner.acks.register(id);
        if outbound.send(Message::text(text)).is_err() {
            self.inner.acks.remove(id);
            return Err(Error::NotConnected);
        }
        tracing::debug!(event, ack = id, "emitted, awaiting acknowledgement");

        self.inner.acks.wait(id, rx, timeout).await
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Register a handler for `event`. Handlers run synchronously on the
    /// session task in registration order and survive reconnects.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.add(event, Arc::new(handler))
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

impl fmt::Debug for CloudLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudLink")
            .field("url", &self.inner.ws_url.as_str())
            .field("agent_id", &self.inner.config.agent_id)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

// ── Shared session state ─────────────────────────────────────────────

impl CloudInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "cloud link state");
        }
    }

    fn connected_sender(&self) -> Option<Arc<mpsc::UnboundedSender<Message>>> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        self.outbound.load_full()
    }

    fn touch(&self) {
        self.last_inbound.send_replace(Some(Utc::now()));
    }

    fn teardown(&self) {
        self.outbound.store(None);
        if *self.state.borrow() != ConnectionState::Error {
            self.set_state(ConnectionState::Disconnected);
        }
        let rejected = self.acks.reject_all(&Error::ConnectionClosed);
        if rejected > 0 {
            tracing::info!(rejected, "rejected pending cloud acknowledgements");
        }
    }

    fn fail(&self, err: Error) {
        tracing::error!(error = %err, "cloud link failed, not retrying");
        self.last_error.store(Some(Arc::new(err)));
        self.set_state(ConnectionState::Error);
    }

    fn handle_text(&self, text: &str, outbound: &mpsc::UnboundedSender<Message>) {
        let frame = match envelope::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed cloud frame");
                return;
            }
        };

        match frame {
            Frame::Ack { id, data } => {
                if !self.acks.resolve(id, envelope::ack_outcome(data)) {
                    tracing::debug!(ack = id, "acknowledgement for unknown or expired emit");
                }
            }
            Frame::Event { name, data, ack } => {
                let event = InboundEvent {
                    name,
                    data,
                    ack: ack.map(|id| AckResponder::new(id, outbound.clone())),
                };
                if self.handlers.dispatch(&event) == 0 {
                    tracing::debug!(event = %event.name, "no handler for cloud event");
                }
            }
        }
    }
}

// ── Background reconnection loop ─────────────────────────────────────

async fn cloud_loop(inner: Arc<CloudInner>, cancel: CancellationToken) {
    let reconnect = inner.config.reconnect.clone();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let mut connected_at: Option<Instant> = None;
        let result = run_session(&inner, &cancel, &mut connected_at).await;
        inner.teardown();

        if cancel.is_cancelled() {
            break;
        }
        if connected_at.is_some_and(|at| reconnect.is_stable(at.elapsed())) {
            attempt = 0;
        }

        match result {
            Ok(SessionEnd::Idle) => tracing::warn!(
                idle_timeout_ms = transport::duration_ms(inner.config.idle_timeout),
                attempt,
                "cloud socket idle, forcing reconnect"
            ),
            Ok(SessionEnd::Closed) => tracing::info!(attempt, "cloud closed the session"),
            Err(e) => tracing::warn!(error = %e, attempt, "cloud session failed"),
        }

        if reconnect.exhausted(attempt) {
            inner.fail(Error::RetriesExhausted { attempts: attempt });
            break;
        }

        let delay = calculate_backoff(attempt, &reconnect);
        tracing::info!(
            delay_ms = transport::duration_ms(delay),
            attempt,
            "waiting before cloud reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }

    tracing::debug!("cloud link loop exiting");
}

// ── Single session lifecycle ─────────────────────────────────────────

async fn run_session(
    inner: &Arc<CloudInner>,
    cancel: &CancellationToken,
    connected_at: &mut Option<Instant>,
) -> Result<SessionEnd, Error> {
    tracing::info!(url = %inner.ws_url, agent_id = %inner.config.agent_id, "connecting to cloud");

    let headers = [
        (
            "Authorization",
            format!("Bearer {}", inner.config.token.expose_secret()),
        ),
        ("X-Agent-Id", inner.config.agent_id.clone()),
    ];
    let request = transport::upgrade_request(&inner.ws_url, &headers)?;
    let stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Closed),
        opened = transport::open(request, inner.config.connect_timeout) => opened?,
    };

    let (mut write, mut read) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    inner.outbound.store(Some(Arc::new(out_tx.clone())));
    inner.touch();
    *connected_at = Some(Instant::now());
    inner.set_state(ConnectionState::Connected);
    inner.sessions.send_modify(|n| *n += 1);
    tracing::info!("cloud connected");

    let session_cancel = cancel.child_token();
    let _session_guard = session_cancel.clone().drop_guard();

    let idle_timeout = inner.config.idle_timeout;
    let check_every = MAX_WATCHDOG_INTERVAL
        .min(idle_timeout / 3)
        .max(Duration::from_millis(1));
    let mut watchdog = tokio::time::interval_at(Instant::now() + check_every, check_every);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = session_cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Closed);
            }
            Some(message) = out_rx.recv() => {
                write.send(message).await?;
            }
            frame = read.next() => {
                if matches!(frame, Some(Ok(_))) {
                    last_seen = Instant::now();
                    inner.touch();
                }
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str(), &out_tx),
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::ConnectionClosed),
                }
            }
            _ = watchdog.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    return Ok(SessionEnd::Idle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> CloudLink {
        let url = Url::parse("https://cloud.example.com/agent").expect("valid url");
        CloudLink::new(CloudLinkConfig::new(
            url,
            SecretString::from("secret".to_owned()),
            "agent-1",
        ))
        .expect("link")
    }

    #[test]
    fn default_reconnect_is_unbounded_with_minute_cap() {
        let config = link().inner.config.clone();
        assert!(config.reconnect.max_retries.is_none());
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(45));
    }

    #[test]
    fn emit_while_disconnected_is_reported() {
        let link = link();
        let err = link
            .emit("capability:changed", serde_json::json!({}))
            .expect_err("dropped");
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn emit_with_callback_while_disconnected_fails_fast() {
        let link = link();
        let err = link
            .emit_with_callback("agent:devices", Value::Null, Duration::from_secs(5))
            .await
            .expect_err("not connected");
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn inbound_event_reaches_handler_with_ack() {
        let link = link();
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.on("device:control", |event| {
            if let Some(ack) = &event.ack {
                ack.respond(serde_json::json!({ "success": true }))
                    .expect("ack sent");
            }
        });

        link.inner
            .handle_text(r#"{"event":"device:control","data":{},"ack":4}"#, &tx);

        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected ack frame");
        };
        assert!(text.as_str().contains(r#""ack":4"#));
    }

    #[tokio::test]
    async fn ack_frames_resolve_pending_emits() {
        let link = link();
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = link.inner.acks.register(2);

        link.inner
            .handle_text(r#"{"ack":2,"data":{"success":false,"message":"nope"}}"#, &tx);

        let outcome = waiter.await.expect("answered");
        assert!(matches!(outcome, Err(Error::Remote { ref message }) if message == "nope"));
    }
}
