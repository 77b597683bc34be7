//! Connection counters.
//!
//! Updated with relaxed atomics from the connection task; read through
//! [`CollabStats::snapshot`] from anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub echoes_ignored: u64,
    pub sends_dropped: u64,
    pub subscriber_panics: u64,
}

#[derive(Debug, Default)]
pub struct CollabStats {
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    echoes_ignored: AtomicU64,
    sends_dropped: AtomicU64,
    subscriber_panics: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl CollabStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        add_connect_attempts => connect_attempts,
        add_connections_opened => connections_opened,
        add_frames_sent => frames_sent,
        add_frames_received => frames_received,
        add_frames_dropped => frames_dropped,
        add_echoes_ignored => echoes_ignored,
        add_sends_dropped => sends_dropped,
        add_subscriber_panics => subscriber_panics,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            echoes_ignored: self.echoes_ignored.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            subscriber_panics: self.subscriber_panics.load(Ordering::Relaxed),
        }
    }
}
