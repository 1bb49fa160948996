//! Persistent session to the controller's RPC + event WebSocket.
//!
//! [`ControllerLink`] owns one background task per connection attempt
//! sequence: open socket → `auth` handshake → read loop, with bounded
//! exponential backoff between attempts. Requests are correlated by a
//! client-assigned integer id; every outstanding request is rejected with
//! [`Error::ConnectionClosed`] when the socket drops.
//!
//! ```rust,ignore
//! let link = ControllerLink::new(ControllerLinkConfig::new(url, token))?;
//! link.connect().await?;
//! let mut changes = link.state_changes();
//! while let Ok(change) = changes.recv().await {
//!     println!("{} → {:?}", change.entity_id, change.new_state.map(|s| s.state));
//! }
//! ```

pub mod protocol;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use self::protocol::{
    ControllerCommand, ControllerEvent, DeviceRegistryEntry, EntityRegistryEntry, EntityState,
    InboundFrame, RawEvent, ServiceTarget, StateChange, StateChangedData,
};
use crate::backoff::{ReconnectConfig, calculate_backoff};
use crate::error::Error;
use crate::pending::PendingRequests;
use crate::transport::{self, WsStream};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const WEBSOCKET_PATH: &str = "/api/websocket";
const STATE_CHANGED: &str = "state_changed";

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the controller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Terminal until the next [`ControllerLink::connect`]: auth was
    /// rejected or the retry budget ran out.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerLinkConfig {
    /// Controller base URL (`http(s)://` or `ws(s)://`). A bare host gets
    /// `/api/websocket` appended.
    pub url: Url,
    /// Long-lived access token sent in the `auth` frame.
    pub token: SecretString,
    /// Deadline for each correlated request. Default: 30s.
    pub request_timeout: Duration,
    /// Deadline for socket open plus the `auth` exchange. Default: 10s.
    pub handshake_timeout: Duration,
    /// Liveness ping cadence while connected. Default: 30s.
    pub ping_interval: Duration,
    /// Default: 10 attempts, 1s initial, 30s cap.
    pub reconnect: ReconnectConfig,
}

impl ControllerLinkConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::bounded(10),
        }
    }
}

// ── ControllerLink ───────────────────────────────────────────────────

/// Handle to the controller session. Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct ControllerLink {
    inner: Arc<LinkInner>,
}

struct Subscription {
    event_type: String,
    /// Id the controller tags events with in the current session.
    server_id: u64,
    /// Session in which `server_id` was issued.
    session: u64,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct LinkInner {
    config: ControllerLinkConfig,
    ws_url: Url,
    state: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<Arc<StateChange>>,
    events: broadcast::Sender<Arc<ControllerEvent>>,
    outbound: ArcSwapOption<mpsc::UnboundedSender<Message>>,
    pending: PendingRequests<Value>,
    next_id: AtomicU64,
    /// Bumped each time a session reaches `Connected`.
    sessions: watch::Sender<u64>,
    /// Id of this session's `state_changed` subscription (0 = none yet).
    state_subscription: AtomicU64,
    subscriptions: DashMap<u64, Subscription>,
    entity_cache: DashMap<String, EntityState>,
    last_error: ArcSwapOption<Error>,
    connect_lock: Mutex<()>,
    cancel: CancellationToken,
    session: Mutex<Option<LoopHandle>>,
}

impl ControllerLink {
    pub fn new(config: ControllerLinkConfig) -> Result<Self, Error> {
        let ws_url = transport::websocket_url(&config.url, Some(WEBSOCKET_PATH))?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sessions, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(LinkInner {
                config,
                ws_url,
                state,
                changes,
                events,
                outbound: ArcSwapOption::empty(),
                pending: PendingRequests::new(),
                next_id: AtomicU64::new(1),
                sessions,
                state_subscription: AtomicU64::new(0),
                subscriptions: DashMap::new(),
                entity_cache: DashMap::new(),
                last_error: ArcSwapOption::empty(),
                connect_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                session: Mutex::new(None),
            }),
        })
    }

    /// The normalized WebSocket URL this link dials.
    pub fn url(&self) -> &Url {
        &self.inner.ws_url
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bring the session up.
    ///
    /// Concurrent callers serialize. Returns immediately when already
    /// connected; when a background reconnect is in progress, waits for
    /// it. Fails on auth rejection or once the retry budget is spent.
    pub async fn connect(&self) -> Result<(), Error> {
        let _guard = self.inner.connect_lock.lock().await;

        let mut sessions = self.inner.sessions.subscribe();
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }

        let mut state_rx = self.inner.state.subscribe();
        let loop_cancel = {
            let mut session = self.inner.session.lock().await;
            let running = session.as_ref().is_some_and(|handle| !handle.task.is_finished())
                && self.connection_state() != ConnectionState::Error;

            if running {
                session
                    .as_ref()
                    .map_or_else(CancellationToken::new, |handle| handle.cancel.clone())
            } else {
                if let Some(stale) = session.take() {
                    stale.cancel.cancel();
                }
                self.inner.last_error.store(None);
                self.inner.set_state(ConnectionState::Connecting);

                let cancel = self.inner.cancel.child_token();
                let task_inner = Arc::clone(&self.inner);
                let task_cancel = cancel.clone();
                let task = tokio::spawn(async move {
                    link_loop(task_inner, task_cancel).await;
                });
                *session = Some(LoopHandle {
                    cancel: cancel.clone(),
                    task,
                });
                cancel
            }
        };

        // A new session counts even if it already dropped again.
        tokio::select! {
            biased;
            () = loop_cancel.cancelled() => Err(Error::NotConnected),
            changed = sessions.changed() => changed.map_err(|_| Error::ConnectionClosed),
            failed = state_rx.wait_for(|s| *s == ConnectionState::Error) => match failed {
                Ok(_) => Err(self.last_error().unwrap_or(Error::NotConnected)),
                Err(_) => Err(Error::ConnectionClosed),
            },
        }
    }

    /// Stop the session loop and its timers, reject pending requests, and
    /// go to `Disconnected`. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let handle = self.inner.session.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(error = %e, "controller session task ended abnormally");
            }
        }
        self.inner.teardown();
        tracing::info!("controller link disconnected");
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection-state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Count of sessions that reached `Connected`. Unlike the state
    /// watch, a drop and reconnect between two reads still shows up as a
    /// changed value.
    pub fn session_watch(&self) -> watch::Receiver<u64> {
        self.inner.sessions.subscribe()
    }

    /// Failure that put the link into `Error`, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.last_error.load_full().map(|e| (*e).clone())
    }

    /// Per-entity changes from the link's own `state_changed` subscription.
    /// Late subscribers miss earlier changes.
    pub fn state_changes(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.inner.changes.subscribe()
    }

    /// Events from subscriptions made via [`subscribe`](Self::subscribe).
    pub fn events(&self) -> broadcast::Receiver<Arc<ControllerEvent>> {
        self.inner.events.subscribe()
    }

    /// Last-known state from the client-side cache.
    pub fn cached_state(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.entity_cache.get(entity_id).map(|entry| entry.clone())
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Issue a command and wait for its `result`.
    ///
    /// Fails immediately with [`Error::NotConnected`] outside the
    /// `Connected` state; nothing is queued.
    pub async fn send_request(&self, command: ControllerCommand) -> Result<Value, Error> {
        let id = self.inner.allocate_id();
        self.inner.request_with_id(id, &command).await
    }

    /// Subscribe to an event type. The returned id is stable across
    /// reconnects; the subscription is re-issued on every new session.
    pub async fn subscribe(&self, event_type: &str) -> Result<u64, Error> {
        let id = self.inner.allocate_id();
        self.inner.subscriptions.insert(
            id,
            Subscription {
                event_type: event_type.to_owned(),
                server_id: id,
                session: *self.inner.sessions.borrow(),
            },
        );

        let command = ControllerCommand::SubscribeEvents {
            event_type: Some(event_type.to_owned()),
        };
        match self.inner.request_with_id(id, &command).await {
            Ok(_) => {
                tracing::debug!(id, event_type, "subscribed to controller events");
                Ok(id)
            }
            Err(e) => {
                self.inner.subscriptions.remove(&id);
                Err(e)
            }
        }
    }

    /// Drop a subscription. When disconnected, it is only forgotten locally.
    pub async fn unsubscribe(&self, id: u64) -> Result<(), Error> {
        let Some((_, subscription)) = self.inner.subscriptions.remove(&id) else {
            return Ok(());
        };
        if self.connection_state() != ConnectionState::Connected {
            return Ok(());
        }
        self.send_request(ControllerCommand::UnsubscribeEvents {
            subscription: subscription.server_id,
        })
        .await
        .map(|_| ())
    }

    /// Fetch every entity's current state and seed the change cache.
    pub async fn get_states(&self) -> Result<Vec<EntityState>, Error> {
        let value = self.send_request(ControllerCommand::GetStates).await?;
        let states: Vec<EntityState> = protocol::decode_result(&value)?;
        for state in &states {
            self.inner
                .entity_cache
                .insert(state.entity_id.clone(), state.clone());
        }
        tracing::debug!(count = states.len(), "fetched controller states");
        Ok(states)
    }

    /// Invoke a controller service, optionally targeting one entity.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        entity_id: Option<&str>,
    ) -> Result<Value, Error> {
        tracing::debug!(domain, service, entity_id, "calling controller service");
        self.send_request(ControllerCommand::CallService {
            domain: domain.to_owned(),
            service: service.to_owned(),
            service_data,
            target: entity_id.map(|id| ServiceTarget {
                entity_id: id.to_owned(),
            }),
        })
        .await
    }

    pub async fn list_entity_registry(&self) -> Result<Vec<EntityRegistryEntry>, Error> {
        let value = self
            .send_request(ControllerCommand::ListEntityRegistry)
            .await?;
        protocol::decode_result(&value)
    }

    pub async fn list_device_registry(&self) -> Result<Vec<DeviceRegistryEntry>, Error> {
        let value = self
            .send_request(ControllerCommand::ListDeviceRegistry)
            .await?;
        protocol::decode_result(&value)
    }

    /// Round-trip a `ping`, returning the latency.
    pub async fn ping(&self) -> Result<Duration, Error> {
        self.inner.ping().await
    }
}

impl fmt::Debug for ControllerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerLink")
            .field("url", &self.inner.ws_url.as_str())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

// ── Shared session state ─────────────────────────────────────────────

impl LinkInner {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "controller link state");
        }
    }

    /// Give up: record the failure and park in `Error`.
    fn fail(&self, err: Error) {
        tracing::error!(error = %err, "controller link failed, not retrying");
        self.last_error.store(Some(Arc::new(err)));
        self.set_state(ConnectionState::Error);
    }

    /// Drop the session's sender, mark disconnected, and reject every
    /// outstanding request.
    fn teardown(&self) {
        self.outbound.store(None);
        self.state_subscription.store(0, Ordering::Release);
        if *self.state.borrow() != ConnectionState::Error {
            self.set_state(ConnectionState::Disconnected);
        }
        let rejected = self.pending.reject_all(&Error::ConnectionClosed);
        if rejected > 0 {
            tracing::info!(rejected, "rejected pending controller requests");
        }
    }

    async fn request_with_id(&self, id: u64, command: &ControllerCommand) -> Result<Value, Error> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let outbound = self.outbound.load_full().ok_or(Error::NotConnected)?;
        let text = protocol::encode_command(id, command)?;

        let rx = self.pending.register(id);
        if outbound.send(Message::text(text)).is_err() {
            self.pending.remove(id);
            return Err(Error::NotConnected);
        }
        self.pending.wait(id, rx, self.config.request_timeout).await
    }

    async fn ping(&self) -> Result<Duration, Error> {
        let started = Instant::now();
        self.request_with_id(self.allocate_id(), &ControllerCommand::Ping)
            .await?;
        Ok(started.elapsed())
    }

    fn handle_frame(&self, text: &str) {
        let frame = match protocol::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed controller frame");
                return;
            }
        };

        match frame {
            InboundFrame::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(error.unwrap_or_default().into_error())
                };
                if !self.pending.resolve(id, outcome) {
                    tracing::debug!(id, "result for unknown or expired request");
                }
            }
            InboundFrame::Pong { id } => {
                self.pending.resolve(id, Ok(Value::Null));
            }
            InboundFrame::Event { id, event } => self.dispatch_event(id, event),
            InboundFrame::AuthRequired { .. }
            | InboundFrame::AuthOk { .. }
            | InboundFrame::AuthInvalid { .. } => {
                tracing::debug!("ignoring auth frame after handshake");
            }
            InboundFrame::Unknown => {
                tracing::debug!(frame = text, "ignoring unknown controller frame type");
            }
        }
    }

    fn dispatch_event(&self, id: u64, event: RawEvent) {
        let state_subscription = self.state_subscription.load(Ordering::Acquire);
        if id == state_subscription && event.event_type == STATE_CHANGED {
            match protocol::decode_result::<StateChangedData>(&event.data) {
                Ok(data) => self.apply_state_change(data),
                Err(e) => tracing::warn!(error = %e, "malformed state_changed event"),
            }
            return;
        }

        let subscription = self
            .subscriptions
            .iter()
            .find(|entry| entry.server_id == id)
            .map(|entry| *entry.key());
        let Some(subscription) = subscription else {
            tracing::debug!(id, event_type = %event.event_type, "event for unknown subscription");
            return;
        };

        // No receivers is fine.
        let _ = self.events.send(Arc::new(ControllerEvent {
            subscription,
            event_type: event.event_type,
            data: event.data,
            time_fired: event.time_fired,
        }));
    }

    /// Pair the cached previous state with the new one, then update the cache.
    fn apply_state_change(&self, data: StateChangedData) {
        let cached = match &data.new_state {
            Some(new_state) => self
                .entity_cache
                .insert(data.entity_id.clone(), new_state.clone()),
            None => self
                .entity_cache
                .remove(&data.entity_id)
                .map(|(_, state)| state),
        };

        let change = StateChange {
            entity_id: data.entity_id,
            old_state: cached.or(data.old_state),
            new_state: data.new_state,
        };
        tracing::trace!(entity_id = %change.entity_id, "state changed");
        let _ = self.changes.send(Arc::new(change));
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// connect → authenticate → read, then backoff → reconnect after every
/// session end, until auth is rejected, retries run out, or the loop is
/// cancelled.
async fn link_loop(inner: Arc<LinkInner>, cancel: CancellationToken) {
    let reconnect = inner.config.reconnect.clone();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let mut connected_at: Option<tokio::time::Instant> = None;
        let result = run_session(&inner, &cancel, &mut connected_at).await;
        inner.teardown();

        if cancel.is_cancelled() {
            break;
        }
        if connected_at.is_some_and(|at| reconnect.is_stable(at.elapsed())) {
            attempt = 0;
        }

        match result {
            Err(e @ Error::Authentication { .. }) => {
                inner.fail(e);
                break;
            }
            Ok(()) => tracing::info!(attempt, "controller closed the session"),
            Err(e) => tracing::warn!(error = %e, attempt, "controller session failed"),
        }

        if reconnect.exhausted(attempt) {
            inner.fail(Error::RetriesExhausted { attempts: attempt });
            break;
        }

        let delay = calculate_backoff(attempt, &reconnect);
        tracing::info!(
            delay_ms = transport::duration_ms(delay),
            attempt,
            "waiting before controller reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }

    tracing::debug!("controller link loop exiting");
}

// ── Single session lifecycle ─────────────────────────────────────────

/// One socket from open to close. `connected_at` is set once auth succeeds.
async fn run_session(
    inner: &Arc<LinkInner>,
    cancel: &CancellationToken,
    connected_at: &mut Option<tokio::time::Instant>,
) -> Result<(), Error> {
    tracing::info!(url = %inner.ws_url, "connecting to controller");
    let handshake_timeout = inner.config.handshake_timeout;

    let request = transport::upgrade_request(&inner.ws_url, &[])?;
    let mut stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        opened = transport::open(request, handshake_timeout) => opened?,
    };

    inner.set_state(ConnectionState::Authenticating);
    let handshake = tokio::time::timeout(
        handshake_timeout,
        authenticate(&mut stream, &inner.config.token),
    );
    let version = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        outcome = handshake => outcome.map_err(|_| Error::Timeout {
            timeout_ms: transport::duration_ms(handshake_timeout),
        })??,
    };

    let (mut write, mut read) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    inner.outbound.store(Some(Arc::new(out_tx)));
    *connected_at = Some(tokio::time::Instant::now());
    inner.set_state(ConnectionState::Connected);
    inner.sessions.send_modify(|n| *n += 1);
    tracing::info!(version = version.as_deref().unwrap_or("unknown"), "controller connected");

    // Session-scoped timers and tasks stop with this guard.
    let session_cancel = cancel.child_token();
    let _session_guard = session_cancel.clone().drop_guard();

    tokio::spawn(restore_subscriptions(
        Arc::clone(inner),
        session_cancel.clone(),
    ));
    tokio::spawn(ping_task(Arc::clone(inner), session_cancel.clone()));

    loop {
        tokio::select! {
            biased;
            () = session_cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            Some(message) = out_rx.recv() => {
                write.send(message).await?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "controller close frame received");
                        } else {
                            tracing::info!("controller close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!("controller stream ended");
                        return Err(Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {
                        // Binary, Ping, Pong, Frame
                    }
                }
            }
        }
    }
}

/// Wait for `auth_required`, answer with the token, expect `auth_ok`.
async fn authenticate(
    stream: &mut WsStream,
    token: &SecretString,
) -> Result<Option<String>, Error> {
    let mut sent = false;

    loop {
        let Some(frame) = stream.next().await else {
            return Err(Error::ConnectionClosed);
        };
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(Error::ConnectionClosed),
            _ => continue,
        };

        match protocol::decode_frame(text.as_str())? {
            InboundFrame::AuthRequired { ha_version } => {
                if !sent {
                    tracing::debug!(version = ?ha_version, "controller requested auth");
                    let auth = protocol::encode_auth(token.expose_secret());
                    stream.send(Message::text(auth)).await?;
                    sent = true;
                }
            }
            InboundFrame::AuthOk { ha_version } => return Ok(ha_version),
            InboundFrame::AuthInvalid { message } => {
                return Err(Error::Authentication {
                    message: message.unwrap_or_else(|| "invalid access token".into()),
                });
            }
            other => tracing::debug!(frame = ?other, "ignoring frame during handshake"),
        }
    }
}

/// Re-establish the `state_changed` subscription and every user
/// subscription not yet issued in this session.
async fn restore_subscriptions(inner: Arc<LinkInner>, cancel: CancellationToken) {
    let work = async {
        let id = inner.allocate_id();
        inner.state_subscription.store(id, Ordering::Release);
        let command = ControllerCommand::SubscribeEvents {
            event_type: Some(STATE_CHANGED.to_owned()),
        };
        if let Err(e) = inner.request_with_id(id, &command).await {
            tracing::warn!(error = %e, "failed to subscribe to state changes");
        }

        let session = *inner.sessions.borrow();
        let stale: Vec<(u64, String)> = inner
            .subscriptions
            .iter()
            .filter(|entry| entry.session != session)
            .map(|entry| (*entry.key(), entry.event_type.clone()))
            .collect();

        for (client_id, event_type) in stale {
            let server_id = inner.allocate_id();
            match inner.subscriptions.get_mut(&client_id) {
                Some(mut entry) => {
                    entry.server_id = server_id;
                    entry.session = session;
                }
                None => continue,
            }
            let command = ControllerCommand::SubscribeEvents {
                event_type: Some(event_type.clone()),
            };
            match inner.request_with_id(server_id, &command).await {
                Ok(_) => tracing::debug!(client_id, event_type, "restored subscription"),
                Err(e) => tracing::warn!(error = %e, event_type, "failed to restore subscription"),
            }
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = work => {}
    }
}

/// Periodic liveness probe. A failed ping is logged only; the socket's own
/// close drives reconnection.
async fn ping_task(inner: Arc<LinkInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.ping().await {
                    Ok(latency) => tracing::trace!(latency_ms = transport::duration_ms(latency), "controller pong"),
                    Err(e) => tracing::debug!(error = %e, "controller ping failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> ControllerLink {
        let url = Url::parse("http://127.0.0.1:8123").expect("valid url");
        ControllerLink::new(ControllerLinkConfig::new(url, SecretString::from("token".to_owned())))
            .expect("link")
    }

    fn state(entity_id: &str, value: &str) -> EntityState {
        EntityState {
            entity_id: entity_id.into(),
            state: value.into(),
            attributes: serde_json::Map::new(),
            last_changed: None,
            last_updated: None,
        }
    }

    #[test]
    fn url_gets_websocket_path() {
        assert_eq!(link().url().as_str(), "ws://127.0.0.1:8123/api/websocket");
    }

    #[tokio::test]
    async fn requests_fail_fast_when_disconnected() {
        let link = link();
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
        let err = link
            .send_request(ControllerCommand::GetStates)
            .await
            .expect_err("must not queue");
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn state_change_uses_cached_previous_state() {
        let link = link();
        link.inner
            .entity_cache
            .insert("light.kitchen".into(), state("light.kitchen", "off"));
        let mut changes = link.state_changes();

        link.inner.apply_state_change(StateChangedData {
            entity_id: "light.kitchen".into(),
            old_state: Some(state("light.kitchen", "stale")),
            new_state: Some(state("light.kitchen", "on")),
        });

        let change = changes.recv().await.expect("change");
        assert_eq!(change.old_state.as_ref().map(|s| s.state.as_str()), Some("off"));
        assert_eq!(change.new_state.as_ref().map(|s| s.state.as_str()), Some("on"));
        assert_eq!(
            link.cached_state("light.kitchen").map(|s| s.state),
            Some("on".to_owned())
        );
    }

    #[tokio::test]
    async fn removed_entity_leaves_cache() {
        let link = link();
        link.inner
            .entity_cache
            .insert("switch.fan".into(), state("switch.fan", "on"));

        link.inner.apply_state_change(StateChangedData {
            entity_id: "switch.fan".into(),
            old_state: None,
            new_state: None,
        });

        assert!(link.cached_state("switch.fan").is_none());
    }

    #[tokio::test]
    async fn result_frames_resolve_pending_requests() {
        let link = link();
        let rx = link.inner.pending.register(4);

        link.inner
            .handle_frame(r#"{"id":4,"type":"result","success":false,"error":{"code":"invalid_format","message":"bad"}}"#);

        let outcome = rx.await.expect("answered");
        assert!(matches!(outcome, Err(Error::Protocol { ref code, .. }) if code == "invalid_format"));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let link = link();
        link.inner.handle_frame("not json");
        link.inner.handle_frame(r#"{"type":"result"}"#);
        assert_eq!(link.inner.pending.len(), 0);
    }
}
