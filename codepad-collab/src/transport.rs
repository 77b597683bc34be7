//! Transport abstraction for the collaboration connection.
//!
//! ```text
//! ConnectionManager ──Connector::connect(url)──► Link
//!                                                 │
//!              outbound: mpsc<String> ────────────┼──► writer task ──► socket
//!              inbound:  mpsc<TransportEvent> ◄───┼─── reader task ◄── socket
//! ```
//!
//! [`WsConnector`] is the tokio-tungstenite implementation. Tests and
//! in-process hosts can build a [`Link`] directly with [`Link::pair`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::CollabConfig;
use crate::error::TransportError;

/// Events produced by the receiving half of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The remote side closed or the socket failed.
    Closed { reason: Option<String> },
}

/// One physical connection.
///
/// Dropping the link closes it: the writer flushes a close frame once the
/// outbound channel is gone and the reader task is aborted.
pub struct Link {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

/// The far side of a [`Link::pair`].
pub struct LinkPeer {
    /// Frames written by the local side.
    pub outbound: mpsc::Receiver<String>,
    /// Events to deliver to the local side.
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl Link {
    pub fn new(outbound: mpsc::Sender<String>, inbound: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    /// An in-memory link and the handle that plays the remote side.
    pub fn pair(buffer: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            Link::new(out_tx, in_rx),
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Queue a frame without waiting. Returns `false` if it was dropped.
    pub fn try_send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound buffer full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Next inbound event. `None` means the link is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens links to a collaboration endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    keepalive: Option<Duration>,
    buffer: usize,
}

impl WsConnector {
    pub fn new(keepalive: Option<Duration>, buffer: usize) -> Self {
        Self {
            keepalive,
            buffer: buffer.max(1),
        }
    }

    pub fn from_config(config: &CollabConfig) -> Self {
        Self::new(config.keepalive_interval(), config.outbound_buffer)
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::from_config(&CollabConfig::default())
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let url = url.to_owned();
        let keepalive = self.keepalive;
        let buffer = self.buffer;

        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (ws_writer, ws_reader) = ws_stream.split();

            let (out_tx, out_rx) = mpsc::channel::<String>(buffer);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(buffer);

            tokio::spawn(write_loop(ws_writer, out_rx, in_tx.clone(), keepalive));
            let reader = tokio::spawn(read_loop(ws_reader, in_tx));

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
                reader: Some(reader),
            })
        }
    }
}

/// Outbound channel to socket, plus keepalive pings.
///
/// Ends with a close frame once the outbound channel is gone. A failed write
/// is reported as [`TransportEvent::Closed`] so the owner can reconnect.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
    keepalive: Option<Duration>,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let mut ticker = keepalive.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let result = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        break Err(e);
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break Ok(());
                }
            },
            () = next_tick(&mut ticker) => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(reason) = result.map_err(|e| e.to_string()) {
        log::warn!("Socket write failed: {reason}");
        let _ = events
            .send(TransportEvent::Closed {
                reason: Some(reason),
            })
            .await;
    }
}

/// Socket to inbound channel, finishing with [`TransportEvent::Closed`].
async fn read_loop<S>(mut stream: S, events: mpsc::Sender<TransportEvent>)
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let reason = loop {
        let event = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                TransportEvent::Frame(text.as_str().to_owned())
            }
            Some(Ok(WsMessage::Binary(data))) => {
                match String::from_utf8(data.to_vec()) {
                    Ok(text) => TransportEvent::Frame(text),
                    Err(_) => {
                        log::debug!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                break frame.map(|f| f.reason.as_str().to_owned());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };
        if events.send(event).await.is_err() {
            return;
        }
    };
    let _ = events.send(TransportEvent::Closed { reason }).await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
