//! Presence broadcasting for the editing surface.
//!
//! ```text
//! local caret move                          remote frame
//!       │                                        │
//!       ▼                                        ▼
//! PresenceBroadcaster::cursor_moved()     SubscriptionRegistry
//!       │  (throttled, 30/s)                     │
//!       ▼                                        ▼
//! CollabService::send()                   RemotePresence::apply()
//!                                                │
//!                                                ▼
//!                                  remote_collaborators() → editor decorations
//! ```
//!
//! Remote edits are not interpreted here; they are handed to the callback
//! registered with [`PresenceBroadcaster::on_remote_edit`].

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::client::CollabService;
use crate::error::ServiceStopped;
use crate::protocol::{Message, MessageKind, Payload, Position, Range, TextChange};
use crate::subscription::{Callback, SubscriptionHandle};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for a collaborator's caret and selection highlight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated color derived from a user id.
    pub fn from_user_id(user_id: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let hue = (hasher.finish() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` for CSS-based editor decorations.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote state
// ───────────────────────────────────────────────────────────────────

/// What we know about one remote collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCollaborator {
    pub user_id: String,
    pub color: CursorColor,
    pub cursor: Option<Position>,
    pub selection: Option<Range>,
    last_seen: Instant,
}

impl RemoteCollaborator {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            color: CursorColor::from_user_id(user_id),
            cursor: None,
            selection: None,
            last_seen: Instant::now(),
        }
    }

    /// When the last message from this collaborator arrived.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Silent for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Remote collaborators keyed by user id, scoped to one session.
#[derive(Debug, Default)]
pub struct RemotePresence {
    peers: HashMap<String, RemoteCollaborator>,
    session: u64,
}

impl RemotePresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align the table with session `epoch`. Entries recorded under another
    /// session are discarded. Returns `true` if the table was reset.
    pub fn sync_session(&mut self, epoch: u64) -> bool {
        if self.session == epoch {
            return false;
        }
        self.session = epoch;
        self.peers.clear();
        true
    }

    /// Fold an inbound message into the table. Any message marks its sender
    /// as active; edits leave caret and selection untouched.
    pub fn apply(&mut self, message: &Message) {
        let peer = self
            .peers
            .entry(message.sender_id.clone())
            .or_insert_with(|| RemoteCollaborator::new(&message.sender_id));
        peer.last_seen = Instant::now();

        match &message.payload {
            Payload::Cursor(p) => peer.cursor = Some(p.position),
            Payload::Selection(p) => peer.selection = Some(p.selection),
            Payload::Edit(_) => {}
        }
    }

    /// Collaborator `user_id`, if it has been seen in this session.
    pub fn get(&self, user_id: &str) -> Option<&RemoteCollaborator> {
        self.peers.get(user_id)
    }

    /// All collaborators, ordered by user id.
    pub fn snapshot(&self) -> Vec<RemoteCollaborator> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    /// Drop collaborators silent for longer than `timeout`.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.is_idle(timeout))
            .map(|p| p.user_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget every collaborator, keeping the session.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor throttle
// ───────────────────────────────────────────────────────────────────

/// Rate limiter for caret updates. The latest throttled position is kept so
/// it can be flushed once the interval has passed.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<Position>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a new position. Returns it if it may be sent now.
    pub fn offer(&mut self, position: Position, now: Instant) -> Option<Position> {
        self.pending = Some(position);
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => None,
            _ => self.pending.take(),
        }
    }

    /// Take the throttled position regardless of the interval.
    pub fn take_pending(&mut self) -> Option<Position> {
        self.pending.take()
    }

    /// Record a send at `now`; the next interval starts here.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Minimum spacing between caret broadcasts (33ms ≈ 30/s).
    pub cursor_interval: Duration,
    /// Collaborators silent this long are dropped by `prune_idle`.
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Bridges the editing surface and a [`CollabService`].
///
/// Remote state belongs to the current session: switching documents or
/// disconnecting empties the collaborator table and discards a held caret.
pub struct PresenceBroadcaster {
    service: CollabService,
    config: PresenceConfig,
    remote: Arc<Mutex<RemotePresence>>,
    /// Session counter shared with the connection task.
    epoch: Arc<AtomicU64>,
    /// Session the throttled caret belongs to.
    cursor_session: u64,
    throttle: CursorThrottle,
    subscriptions: Vec<SubscriptionHandle>,
}

impl PresenceBroadcaster {
    /// Subscribe to remote presence on `service`.
    pub async fn attach(
        service: CollabService,
        config: PresenceConfig,
    ) -> Result<Self, ServiceStopped> {
        let epoch = service.session_epoch_handle();
        let current = epoch.load(Ordering::SeqCst);
        let mut table = RemotePresence::new();
        table.sync_session(current);
        let remote = Arc::new(Mutex::new(table));

        // Runs on the connection task, after any session change it made.
        let shared = remote.clone();
        let session = epoch.clone();
        let track: Callback = Arc::new(move |message: &Message| {
            let mut table = shared.lock();
            table.sync_session(session.load(Ordering::SeqCst));
            table.apply(message);
        });

        let mut subscriptions = Vec::with_capacity(MessageKind::ALL.len());
        for kind in MessageKind::ALL {
            subscriptions.push(service.subscribe_callback(kind, track.clone()).await?);
        }

        Ok(Self {
            service,
            config,
            remote,
            epoch,
            cursor_session: current,
            throttle: CursorThrottle::new(config.cursor_interval),
            subscriptions,
        })
    }

    /// Register the editor's applier for remote edits.
    ///
    /// The callback receives the sender id and the ordered changes.
    pub async fn on_remote_edit<F>(
        &mut self,
        apply: F,
    ) -> Result<SubscriptionHandle, ServiceStopped>
    where
        F: Fn(&str, &[TextChange]) + Send + Sync + 'static,
    {
        let handle = self
            .service
            .subscribe(MessageKind::Edit, move |message: &Message| {
                if let Some(edit) = message.as_edit() {
                    apply(&message.sender_id, &edit.changes);
                }
            })
            .await?;
        self.subscriptions.push(handle);
        Ok(handle)
    }

    /// Local caret moved. Returns `true` if an update went out now; otherwise
    /// the position is held until the next move or [`Self::flush_cursor`].
    pub fn cursor_moved(&mut self, position: Position) -> bool {
        self.sync_cursor_session();
        let now = Instant::now();
        match self.throttle.offer(position, now) {
            Some(position) => self.send_cursor(position, now),
            None => false,
        }
    }

    /// Send the held caret position, if any, ignoring the throttle.
    pub fn flush_cursor(&mut self) -> bool {
        self.sync_cursor_session();
        match self.throttle.take_pending() {
            Some(position) => self.send_cursor(position, Instant::now()),
            None => false,
        }
    }

    /// A caret held back during the previous session is not sent into the
    /// next one.
    fn sync_cursor_session(&mut self) {
        let current = self.epoch.load(Ordering::SeqCst);
        if self.cursor_session != current {
            self.cursor_session = current;
            self.throttle.take_pending();
        }
    }

    fn send_cursor(&mut self, position: Position, now: Instant) -> bool {
        let sent = self.service.send(Payload::cursor(position));
        if sent {
            self.throttle.mark_sent(now);
        }
        sent
    }

    /// Local selection changed. Sent immediately, never throttled.
    pub fn selection_changed(&mut self, selection: Range) -> bool {
        self.service.send(Payload::selection(selection))
    }

    /// Local edits applied to the buffer, in application order.
    pub fn edits_applied(&mut self, changes: Vec<TextChange>) -> bool {
        if changes.is_empty() {
            return false;
        }
        self.service.send(Payload::edit(changes))
    }

    /// Remote collaborators for rendering, ordered by user id.
    pub fn remote_collaborators(&self) -> Vec<RemoteCollaborator> {
        self.table().snapshot()
    }

    /// One remote collaborator of the current session.
    pub fn remote_collaborator(&self, user_id: &str) -> Option<RemoteCollaborator> {
        self.table().get(user_id).cloned()
    }

    /// Drop collaborators idle past the configured timeout.
    pub fn prune_idle(&self) -> Vec<String> {
        let pruned = self.table().prune_idle(self.config.idle_timeout);
        for id in &pruned {
            log::debug!("Collaborator {id} went idle");
        }
        pruned
    }

    /// Whether a throttled caret position is waiting for `flush_cursor`.
    pub fn has_pending_cursor(&self) -> bool {
        self.throttle.has_pending()
    }

    /// The service this broadcaster sends through.
    pub fn service(&self) -> &CollabService {
        &self.service
    }

    fn table(&self) -> MutexGuard<'_, RemotePresence> {
        let mut table = self.remote.lock();
        table.sync_session(self.epoch.load(Ordering::SeqCst));
        table
    }

    /// Unsubscribe everything this broadcaster registered.
    pub fn detach(self) {
        for handle in self.subscriptions {
            self.service.unsubscribe(handle);
        }
        self.remote.lock().clear();
    }
}
