//! Connection manager for the per-document collaboration channel.
//!
//! A single task owns the session, the subscriber registry, the pending
//! connect attempt, the live link and the retry timer. Every public call on
//! [`CollabService`] is turned into a [`Command`] and applied on that task,
//! so state is never touched from two places at once.
//!
//! ```text
//!            connect(file_id)
//!   Closed ───────────────────► Connecting ──accept──► Open
//!     ▲  ▲                          │                    │
//!     │  └──── retry timer ◄── failure/timeout           │
//!     │            ▲                                     │
//!     │            └──────────── close / error ──────────┘
//!     └──── disconnect() (cancels timer + attempt)
//! ```
//!
//! Superseding a session (a new `connect`) or leaving it (`disconnect`)
//! drops the old link, the pending attempt and the timer before anything
//! else happens, so at most one physical connection exists per service.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::error::{DecodeError, ServiceStopped, TransportError};
use crate::protocol::{self, Message, MessageKind, Payload};
use crate::reconnect::Backoff;
use crate::stats::{CollabStats, StatsSnapshot};
use crate::subscription::{Callback, SubscriptionHandle, SubscriptionRegistry};
use crate::transport::{Connector, Link, TransportEvent, WsConnector};

/// Physical connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Consumer-facing session status, suitable for a "reconnecting…" badge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabStatus {
    /// No session requested.
    Idle,
    /// Attempt `attempt` in flight (0 = initial connect).
    Connecting { attempt: u32 },
    Open,
    /// Connection lost; the next attempt starts after `retry_in`.
    Reconnecting { attempt: u32, retry_in: Duration },
    /// The reconnect policy gave up. A new `connect` starts over.
    Offline { attempts: u32 },
}

/// The document channel currently wanted by the caller.
#[derive(Debug, Clone)]
struct Session {
    file_id: String,
    state: ConnectionState,
}

enum Command {
    Connect(String),
    Disconnect,
    Send(Payload),
    Subscribe {
        kind: MessageKind,
        callback: Callback,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe(SubscriptionHandle),
}

type PendingConnect = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send>>;

// ───────────────────────────────────────────────────────────────────
// Connection manager (task side)
// ───────────────────────────────────────────────────────────────────

struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    config: CollabConfig,
    local_user_id: Arc<str>,

    session: Option<Session>,
    registry: SubscriptionRegistry,
    backoff: Backoff,

    /// Connect attempt in flight. Dropping it cancels the attempt.
    pending: Option<PendingConnect>,
    /// Live connection, present only while `Open`.
    link: Option<Link>,
    /// Scheduled reconnect. Dropping it cancels the retry.
    retry: Option<Pin<Box<Sleep>>>,

    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<CollabStatus>,
    stats: Arc<CollabStats>,
    /// Bumped whenever a session ends or is replaced.
    session_epoch: Arc<AtomicU64>,
}

impl<C: Connector> ConnectionManager<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },

                result = poll_slot(&mut self.pending) => {
                    self.pending = None;
                    self.on_connect_result(result);
                }

                event = next_event(&mut self.link) => {
                    self.on_transport_event(event);
                }

                () = poll_slot(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry_due();
                }
            }
        }

        self.teardown();
        log::debug!("Collaboration task for {} stopped", self.local_user_id);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(file_id) => self.connect(file_id),
            Command::Disconnect => self.disconnect(),
            Command::Send(payload) => self.send(payload),
            Command::Subscribe { kind, callback, reply } => {
                let handle = self.registry.subscribe(kind, callback);
                let _ = reply.send(handle);
            }
            Command::Unsubscribe(handle) => {
                self.registry.unsubscribe(handle);
            }
        }
    }

    fn connect(&mut self, file_id: String) {
        self.teardown();
        log::info!("Opening collaboration session for {file_id}");
        self.session = Some(Session {
            file_id,
            state: ConnectionState::Closed,
        });
        self.begin_attempt(0);
    }

    fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            log::info!("Leaving collaboration session for {}", session.file_id);
        }
        self.teardown();
        self.status_tx.send_replace(CollabStatus::Idle);
    }

    /// Drop everything connection-related: timer, attempt, link, session.
    fn teardown(&mut self) {
        self.retry = None;
        self.pending = None;
        self.link = None;
        if self.session.take().is_some() {
            self.session_epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.backoff.reset();
        self.set_state(ConnectionState::Closed);
    }

    fn begin_attempt(&mut self, attempt: u32) {
        let Some(session) = &self.session else {
            return;
        };

        let url = self.config.session_url(&session.file_id);
        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout();
        log::debug!("Connecting to {url} (attempt {attempt})");

        self.pending = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
        self.stats.add_connect_attempts(1);
        self.set_state(ConnectionState::Connecting);
        self.status_tx.send_replace(CollabStatus::Connecting { attempt });
    }

    fn on_connect_result(&mut self, result: Result<Link, TransportError>) {
        let Some(session) = &self.session else {
            return;
        };

        match result {
            Ok(link) => {
                log::info!("Collaboration channel open for {}", session.file_id);
                self.link = Some(link);
                self.backoff.reset();
                self.stats.add_connections_opened(1);
                self.set_state(ConnectionState::Open);
                self.status_tx.send_replace(CollabStatus::Open);
            }
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", session.file_id);
                self.set_state(ConnectionState::Closed);
                self.schedule_retry();
            }
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(text)) => self.on_frame(&text),
            Some(TransportEvent::Closed { reason }) => {
                self.on_closed(reason.as_deref().unwrap_or("closed by peer"));
            }
            None => self.on_closed("transport gone"),
        }
    }

    fn on_frame(&mut self, text: &str) {
        self.stats.add_frames_received(1);

        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(DecodeError::UnknownKind(kind)) => {
                log::debug!("Dropping frame of unknown kind `{kind}`");
                self.stats.add_frames_dropped(1);
                return;
            }
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                self.stats.add_frames_dropped(1);
                return;
            }
        };

        if self.config.ignore_own_echoes && message.sender_id.as_str() == &*self.local_user_id {
            self.stats.add_echoes_ignored(1);
            return;
        }

        let report = self.registry.dispatch(&message);
        if report.panicked > 0 {
            self.stats.add_subscriber_panics(report.panicked as u64);
        }
    }

    fn on_closed(&mut self, reason: &str) {
        self.link = None;
        self.set_state(ConnectionState::Closed);
        if let Some(session) = &self.session {
            log::warn!("Collaboration channel for {} lost: {reason}", session.file_id);
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.retry = None;
        if self.session.is_none() {
            return;
        }

        match self.backoff.next() {
            Some((attempt, delay)) => {
                log::info!("Reconnecting in {delay:?} (attempt {attempt})");
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                self.status_tx
                    .send_replace(CollabStatus::Reconnecting { attempt, retry_in: delay });
            }
            None => {
                let attempts = self.backoff.attempts().saturating_sub(1);
                log::error!("Giving up on collaboration channel after {attempts} retries");
                self.status_tx.send_replace(CollabStatus::Offline { attempts });
            }
        }
    }

    fn on_retry_due(&mut self) {
        let attempt = self.backoff.attempts();
        self.begin_attempt(attempt);
    }

    fn send(&mut self, payload: Payload) {
        let link = match (&self.session, &self.link) {
            (Some(session), Some(link)) if session.state == ConnectionState::Open => link,
            _ => {
                log::trace!("Dropping {} event: channel not open", payload.kind());
                self.stats.add_sends_dropped(1);
                return;
            }
        };

        match protocol::encode(&self.local_user_id, &payload) {
            Ok(frame) => {
                if link.try_send(frame) {
                    self.stats.add_frames_sent(1);
                } else {
                    self.stats.add_sends_dropped(1);
                }
            }
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", payload.kind());
                self.stats.add_sends_dropped(1);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if let Some(session) = &mut self.session {
            session.state = state;
        }
        self.state_tx.send_replace(state);
    }
}

/// Await the future in `slot`, or never resolve when the slot is empty.
async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<Link>) -> Option<TransportEvent> {
    match link.as_mut() {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

// ───────────────────────────────────────────────────────────────────
// Service handle (caller side)
// ───────────────────────────────────────────────────────────────────

/// Handle to a collaboration service.
///
/// Cheap to clone; all clones drive the same session. The background task
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct CollabService {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    status_rx: watch::Receiver<CollabStatus>,
    local_user_id: Arc<str>,
    stats: Arc<CollabStats>,
    session_epoch: Arc<AtomicU64>,
}

impl CollabService {
    /// Start a service that connects over WebSocket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CollabConfig) -> Self {
        let connector = WsConnector::from_config(&config);
        Self::with_connector(config, connector)
    }

    /// Start a service over a custom transport.
    pub fn with_connector<C: Connector>(config: CollabConfig, connector: C) -> Self {
        let local_user_id: Arc<str> = match &config.local_user_id {
            Some(id) => id.as_str().into(),
            None => Uuid::new_v4().simple().to_string().into(),
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let (status_tx, status_rx) = watch::channel(CollabStatus::Idle);
        let stats = Arc::new(CollabStats::new());
        let session_epoch = Arc::new(AtomicU64::new(0));

        let manager = ConnectionManager {
            connector: Arc::new(connector),
            backoff: Backoff::new(config.reconnect.clone()),
            config,
            local_user_id: local_user_id.clone(),
            session: None,
            registry: SubscriptionRegistry::new(),
            pending: None,
            link: None,
            retry: None,
            commands: cmd_rx,
            state_tx,
            status_tx,
            stats: stats.clone(),
            session_epoch: session_epoch.clone(),
        };
        tokio::spawn(manager.run());

        Self {
            commands: cmd_tx,
            state_rx,
            status_rx,
            local_user_id,
            stats,
            session_epoch,
        }
    }

    /// Open (or reopen) the channel for `file_id`, replacing any current
    /// session. Always starts a fresh attempt.
    pub fn connect(&self, file_id: impl Into<String>) {
        self.command(Command::Connect(file_id.into()));
    }

    /// Leave the current session and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send an event to collaborators.
    ///
    /// Fire-and-forget: returns `false` (and sends nothing) when the channel
    /// is not open. A `true` result means the event was handed to the
    /// connection task; it can still be dropped if the channel closes first.
    pub fn send(&self, payload: Payload) -> bool {
        if *self.state_rx.borrow() != ConnectionState::Open {
            self.stats.add_sends_dropped(1);
            return false;
        }
        self.command(Command::Send(payload))
    }

    /// Register `callback` for inbound messages of `kind`.
    ///
    /// Subscriptions outlive sessions: they keep receiving after reconnects
    /// and after `connect` switches documents.
    ///
    /// Each call wraps `callback` in a new `Arc`, so registering the same
    /// function twice here yields two subscriptions. Use
    /// [`Self::subscribe_callback`] with a shared [`Callback`] to register
    /// it once.
    pub async fn subscribe<F>(
        &self,
        kind: MessageKind,
        callback: F,
    ) -> Result<SubscriptionHandle, ServiceStopped>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe_callback(kind, Arc::new(callback)).await
    }

    /// Register a shared callback. Subscribing the same `Arc` twice for the
    /// same kind yields the same handle.
    pub async fn subscribe_callback(
        &self,
        kind: MessageKind,
        callback: Callback,
    ) -> Result<SubscriptionHandle, ServiceStopped> {
        let (reply, handle_rx) = oneshot::channel();
        self.command(Command::Subscribe { kind, callback, reply });
        handle_rx.await.map_err(|_| ServiceStopped)
    }

    /// Remove a subscription. The callback is not invoked for any message
    /// dispatched after this command is processed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.command(Command::Unsubscribe(handle));
    }

    /// Current physical connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current consumer-facing status.
    pub fn status(&self) -> CollabStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that observes every status change, including retry
    /// scheduling and giving up.
    pub fn watch_status(&self) -> watch::Receiver<CollabStatus> {
        self.status_rx.clone()
    }

    /// Counter that advances each time a session ends or is replaced by
    /// `connect`. Reconnects inside one session leave it unchanged.
    pub fn session_epoch(&self) -> u64 {
        self.session_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn session_epoch_handle(&self) -> Arc<AtomicU64> {
        self.session_epoch.clone()
    }

    /// Identity stamped on every outbound frame. Stable for the lifetime of
    /// the service, across reconnects and document switches.
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Point-in-time copy of the connection counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn command(&self, cmd: Command) -> bool {
        self.commands.send(cmd).is_ok()
    }
}
