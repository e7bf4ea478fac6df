//! Persistent WebSocket session
//!
//! One physical connection is owned at a time. The access token is passed as
//! a `token` query parameter on connect. While open, a heartbeat frame is
//! written every `heartbeat_interval`. Inbound frames go to the consumer
//! callback as JSON when they parse, raw text otherwise.
//!
//! There is no automatic reconnect: after any termination the session is
//! `Disconnected` until `connect` is called again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::protocol::{InboundPayload, OutboundMessage};

/// Connection state of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Local,
    /// The server closed the connection (or the stream ended)
    Remote { code: Option<u16>, reason: String },
    /// Handshake or I/O failure
    Error(String),
}

/// Event delivered to the consumer callback
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Message(InboundPayload),
    /// Always the last event of a connection
    Closed(CloseReason),
}

struct Connection {
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    /// Bumped on every connect so a finished connection task can tell
    /// whether the slot still belongs to it.
    generation: u64,
    conn: Option<Connection>,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// WebSocket session with heartbeat
#[derive(Clone)]
pub struct SessionSocket {
    ws_url: String,
    heartbeat_interval: Duration,
    store: Arc<dyn CredentialStore>,
    slot: SharedSlot,
}

impl SessionSocket {
    pub fn new(config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            store,
            slot: Arc::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.slot)
            .conn
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state)
    }

    /// Open the connection in the background.
    ///
    /// A no-op while a connection is already owned (connecting or open).
    /// Connection failures are reported as `SocketEvent::Closed` with
    /// `CloseReason::Error`; only an unusable URL is returned as an error.
    /// Must be called from within a tokio runtime.
    pub fn connect<F>(&self, on_event: F) -> Result<(), ClientError>
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.conn.is_some() {
            tracing::debug!("Socket already connected, ignoring connect");
            return Ok(());
        }

        let url = self.connect_url()?;
        slot.generation += 1;
        let generation = slot.generation;

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        slot.conn = Some(Connection {
            state: ConnectionState::Connecting,
            outbound: outbound_tx,
            cancel: cancel.clone(),
        });
        drop(slot);

        tracing::info!("Connecting socket to {}", self.ws_url);
        let task = ConnectionTask {
            slot: Arc::clone(&self.slot),
            generation,
            heartbeat_interval: self.heartbeat_interval,
            cancel,
            outbound: outbound_rx,
        };
        tokio::spawn(task.run(url, on_event));
        Ok(())
    }

    /// Send a message if the connection is open.
    ///
    /// While not open the message is dropped: nothing is queued and no error
    /// is raised. Callers that need delivery must check `state()` first.
    pub fn send(&self, message: &OutboundMessage) {
        let slot = lock(&self.slot);
        let Some(conn) = slot.conn.as_ref().filter(|c| c.state == ConnectionState::Open) else {
            tracing::debug!("Socket not open, dropping outbound message");
            return;
        };

        if let Some(frame) = encode_frame(message) {
            // Fails only if the connection task already exited.
            let _ = conn.outbound.send(frame);
        }
    }

    /// Stop the heartbeat and close the connection, if any. Idempotent.
    ///
    /// Messages already accepted by [`send`](Self::send) are written before
    /// the close frame.
    pub fn close(&self) {
        let conn = lock(&self.slot).conn.take();
        if let Some(conn) = conn {
            tracing::info!("Closing socket");
            conn.cancel.cancel();
        }
    }

    fn connect_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", self.ws_url, e)))?;

        if let Some(token) = self.store.access_token() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != "token")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept)
                .append_pair("token", &token);
        }

        Ok(url)
    }
}

fn encode_frame(message: &OutboundMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("Failed to encode outbound message: {}", e);
            None
        }
    }
}

/// Background task driving one physical connection
struct ConnectionTask {
    slot: SharedSlot,
    generation: u64,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl ConnectionTask {
    async fn run<F>(mut self, url: Url, mut on_event: F)
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = connect_async(url.as_str()) => Some(result),
        };

        let mut ws = match connected {
            None => {
                on_event(SocketEvent::Closed(CloseReason::Local));
                return;
            }
            Some(Err(e)) => {
                tracing::warn!("Socket connect failed: {}", e);
                self.release();
                on_event(SocketEvent::Closed(CloseReason::Error(e.to_string())));
                return;
            }
            Some(Ok((ws, _))) => ws,
        };

        if !self.set_state(ConnectionState::Open) {
            // close() won the race with the handshake
            let _ = ws.close(None).await;
            on_event(SocketEvent::Closed(CloseReason::Local));
            return;
        }
        tracing::info!("Socket open");
        on_event(SocketEvent::Opened);

        let (mut sink, mut stream) = ws.split();
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Frames accepted by send() before close() still go out
                    while let Ok(frame) = self.outbound.try_recv() {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    break CloseReason::Local;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        on_event(SocketEvent::Message(InboundPayload::decode(text.as_str())));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        on_event(SocketEvent::Message(InboundPayload::decode_bytes(&bytes)));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseReason::Remote {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_string(),
                            },
                            None => CloseReason::Remote { code: None, reason: String::new() },
                        };
                    }
                    // ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Error(e.to_string()),
                    None => break CloseReason::Remote { code: None, reason: String::new() },
                },
                Some(frame) = self.outbound.recv() => {
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    let Some(frame) = encode_frame(&OutboundMessage::Heartbeat) else {
                        continue;
                    };
                    tracing::debug!("Sending heartbeat");
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
            }
        };

        if !matches!(reason, CloseReason::Local) {
            self.set_state(ConnectionState::Closing);
            let _ = sink.close().await;
        }
        self.release();

        match &reason {
            CloseReason::Error(e) => tracing::warn!("Socket closed with error: {}", e),
            other => tracing::info!("Socket closed: {:?}", other),
        }
        on_event(SocketEvent::Closed(reason));
    }

    /// Update the state if the slot still belongs to this connection.
    fn set_state(&self, state: ConnectionState) -> bool {
        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            return false;
        }
        match slot.conn.as_mut() {
            Some(conn) => {
                conn.state = state;
                true
            }
            None => false,
        }
    }

    /// Give up ownership so a later `connect` can open a new connection.
    fn release(&self) {
        let mut slot = lock(&self.slot);
        if slot.generation == self.generation {
            slot.conn = None;
        }
    }
}
