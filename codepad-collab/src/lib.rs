//! # codepad-collab: Realtime collaboration channel for CodePad
//!
//! Keeps one WebSocket per open document and relays caret, selection and
//! edit events between everyone editing it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐                      ┌──────────────────┐
//! │ PresenceBroadcaster  │                      │ collaboration    │
//! │ (editor bridge)      │                      │ server (relay)   │
//! └──────────┬───────────┘                      └────────┬─────────┘
//!            │ send / subscribe                          │
//!            ▼                                           │
//! ┌──────────────────────┐   JSON text frames   ┌────────┴─────────┐
//! │ CollabService        │ ◄──────────────────► │ /collaboration/  │
//! │ (handle, cloneable)  │                      │   {fileId}       │
//! └──────────┬───────────┘                      └──────────────────┘
//!            │ commands
//!            ▼
//! ┌──────────────────────┐
//! │ ConnectionManager    │── SubscriptionRegistry (fan-out)
//! │ (single task)        │── Backoff (ReconnectPolicy)
//! └──────────────────────┘── Connector → Link
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire format (`{type, userId, payload}`)
//! - [`subscription`]: Per-kind callback sets with panic isolation
//! - [`reconnect`]: Capped exponential backoff
//! - [`transport`]: Connector trait and the tokio-tungstenite link
//! - [`client`]: Connection manager and the [`CollabService`] handle
//! - [`presence`]: Editor-facing broadcaster and remote caret table
//! - [`config`]: Service configuration
//! - [`stats`]: Connection counters

pub mod client;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod stats;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use client::{CollabService, CollabStatus, ConnectionState};
pub use config::CollabConfig;
pub use error::{CodecError, ConfigError, DecodeError, ServiceStopped, TransportError};
pub use presence::{
    CursorColor, CursorThrottle, PresenceBroadcaster, PresenceConfig, RemoteCollaborator,
    RemotePresence,
};
pub use protocol::{
    CursorPayload, EditPayload, Message, MessageKind, Payload, Position, Range, SelectionPayload,
    TextChange,
};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use stats::StatsSnapshot;
pub use subscription::{Callback, DispatchReport, SubscriptionHandle, SubscriptionRegistry};
pub use transport::{Connector, Link, LinkPeer, TransportEvent, WsConnector};
