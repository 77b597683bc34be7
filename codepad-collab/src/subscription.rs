//! Per-kind subscriber registry with isolated fan-out.
//!
//! ```text
//! Message ──► kind ──► [cb₁, cb₂, …] ──► each call wrapped in catch_unwind
//! ```
//!
//! The registry is plain data: it is owned by the connection task and only
//! ever mutated there, so it needs no locking of its own.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::protocol::{Message, MessageKind};

/// Subscriber callback. Identity is the `Arc` allocation.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: MessageKind,
    id: u64,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub panicked: usize,
}

struct Entry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: HashMap<MessageKind, Vec<Entry>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind`.
    ///
    /// Registering the same callback twice for the same kind keeps a single
    /// entry and returns the handle of the existing one.
    pub fn subscribe(&mut self, kind: MessageKind, callback: Callback) -> SubscriptionHandle {
        let entries = self.subscribers.entry(kind).or_default();
        if let Some(existing) = entries.iter().find(|e| Arc::ptr_eq(&e.callback, &callback)) {
            return SubscriptionHandle { kind, id: existing.id };
        }

        self.next_id += 1;
        let id = self.next_id;
        entries.push(Entry { id, callback });
        SubscriptionHandle { kind, id }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(entries) = self.subscribers.get_mut(&handle.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != handle.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.subscribers.remove(&handle.kind);
        }
        removed
    }

    /// Invoke every callback registered for the message's kind.
    ///
    /// A panicking callback is logged and skipped; the rest still run.
    pub fn dispatch(&self, message: &Message) -> DispatchReport {
        let mut report = DispatchReport::default();
        let kind = message.kind();
        let Some(entries) = self.subscribers.get(&kind) else {
            return report;
        };

        for entry in entries {
            let callback = &entry.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(()) => report.delivered += 1,
                Err(cause) => {
                    report.panicked += 1;
                    log::error!(
                        "{kind} subscriber #{} panicked: {}",
                        entry.id,
                        panic_message(cause.as_ref())
                    );
                }
            }
        }

        report
    }

    /// Number of subscribers for `kind`.
    pub fn len(&self, kind: MessageKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.values().all(Vec::is_empty)
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
