//! Shared fixtures for integration tests.
//!
//! - [`MockConnector`]: in-memory links, driven from the test.
//! - [`Relay`]: a minimal collaboration server on a real socket that
//!   rebroadcasts each frame to the other connections on the same path.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codepad_collab::{Connector, Link, LinkPeer, TransportError, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ───────────────────────────────────────────────────────────────────
// Mock connector
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    urls: Mutex<Vec<String>>,
    peers: Mutex<VecDeque<LinkPeer>>,
    /// One inbound sender per link ever opened; closed once the link drops.
    links: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    refuse: AtomicBool,
    hang: AtomicBool,
    cancelled: AtomicUsize,
}

/// Connector that hands out in-memory links.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

struct CancelGuard(Arc<MockState>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every attempt until cleared.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make attempts never complete until cleared.
    pub fn set_hang(&self, hang: bool) {
        self.state.hang.store(hang, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.urls.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.urls.lock().len()
    }

    /// Hung attempts dropped before completing.
    pub fn cancelled(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Links still held by a service.
    pub fn live_links(&self) -> usize {
        self.state.links.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Remote side of the oldest link not yet taken.
    pub fn take_peer(&self) -> LinkPeer {
        self.state
            .peers
            .lock()
            .pop_front()
            .expect("no link has been opened")
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
        self.state.urls.lock().push(url.to_owned());

        let outcome = if self.state.hang.load(Ordering::SeqCst) {
            Err(CancelGuard(self.state.clone()))
        } else if self.state.refuse.load(Ordering::SeqCst) {
            Ok(Err(TransportError::Refused(url.to_owned())))
        } else {
            let (link, peer) = Link::pair(64);
            self.state.links.lock().push(peer.inbound.clone());
            self.state.peers.lock().push_back(peer);
            Ok(Ok(link))
        };

        async move {
            match outcome {
                Ok(result) => result,
                Err(guard) => {
                    std::future::pending::<()>().await;
                    drop(guard);
                    Err(TransportError::Timeout(Duration::ZERO))
                }
            }
        }
    }
}

/// Deliver one inbound text frame through `peer`.
pub async fn deliver(peer: &LinkPeer, frame: &str) {
    peer.inbound
        .send(TransportEvent::Frame(frame.to_owned()))
        .await
        .expect("link dropped");
}

// ───────────────────────────────────────────────────────────────────
// Relay server
// ───────────────────────────────────────────────────────────────────

type Frame = (u64, String);

#[derive(Default)]
struct RelayState {
    rooms: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
    paths: Mutex<Vec<String>>,
    frames: Mutex<Vec<String>>,
    live: AtomicUsize,
    next_id: AtomicU64,
}

/// Rebroadcasts every text frame to the other connections on the same path.
pub struct Relay {
    pub url: String,
    state: Arc<RelayState>,
    kick: watch::Sender<u64>,
}

impl Relay {
    pub async fn start() -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());
        let (kick, _) = watch::channel(0u64);

        let accept_state = state.clone();
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let kick = accept_kick.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, state, kick).await {
                        log::debug!("Relay connection ended: {e}");
                    }
                });
            }
        });

        Relay {
            url: format!("ws://{addr}"),
            state,
            kick,
        }
    }

    /// Request paths of every accepted connection, in order.
    pub fn paths(&self) -> Vec<String> {
        self.state.paths.lock().clone()
    }

    /// Every text frame received from any client.
    pub fn frames(&self) -> Vec<String> {
        self.state.frames.lock().clone()
    }

    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Close every open connection from the server side.
    pub fn drop_all(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Wait until `accepted` connections have been accepted in total.
    pub async fn wait_for_accepted(&self, accepted: usize) {
        let wait = async {
            while self.state.paths.lock().len() < accepted {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("relay did not accept enough connections");
    }

    /// Wait until `count` frames have been received.
    pub async fn wait_for_frames(&self, count: usize) {
        let wait = async {
            while self.state.frames.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("relay did not receive enough frames");
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<RelayState>,
    mut kick: watch::Receiver<u64>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut path = String::new();
    let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_owned();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, record_path).await?;

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let room = state
        .rooms
        .lock()
        .entry(path.clone())
        .or_insert_with(|| broadcast::channel(256).0)
        .clone();
    let mut rx = room.subscribe();
    state.paths.lock().push(path);
    state.live.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let result = loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let text = text.as_str().to_owned();
                    state.frames.lock().push(text.clone());
                    let _ = room.send((id, text));
                }
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            },
            frame = rx.recv() => match frame {
                Ok((from, text)) if from != id => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        break Err(e);
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            _ = kick.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break Ok(());
            }
        }
    };

    state.live.fetch_sub(1, Ordering::SeqCst);
    result
}
