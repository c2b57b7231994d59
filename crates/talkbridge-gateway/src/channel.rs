use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use talkbridge_types::events::Envelope;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::TransportError;
use crate::state::{ChannelState, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Bound on connecting and on each send.
    pub send_timeout: Duration,
}

/// Write half of one live connection.
struct Link {
    sink: SplitSink<WsStream, Message>,
    generation: u64,
}

struct Inner {
    config: ChannelConfig,
    /// Held for the whole of each send, so both relay loops can share it.
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

/// Persistent WebSocket connection to the collector.
///
/// When the connection drops, a background task reconnects on a fixed
/// interval with a bounded number of attempts; past the bound the state
/// becomes [`ChannelState::Abandoned`] for good.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                state_tx,
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect now. If that fails, the background reconnect takes over.
    pub async fn start(config: ChannelConfig) -> Self {
        let channel = Self::new(config);
        let opened = {
            let mut link = channel.inner.link.lock().await;
            match channel.inner.open_link().await {
                Ok(l) => {
                    *link = Some(l);
                    true
                }
                Err(e) => {
                    warn!("Initial connect to {} failed: {}", channel.inner.config.url, e);
                    false
                }
            }
        };
        if !opened {
            channel.inner.spawn_reconnect();
        }
        channel
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Serialize and send one envelope.
    ///
    /// If no connection is live, exactly one reconnect is tried inline before
    /// giving up. Retrying a failed send is the caller's decision.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(envelope)?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state().is_abandoned() {
            return Err(TransportError::Abandoned(self.inner.config.reconnect.max_attempts));
        }

        let mut link = self.inner.link.lock().await;
        if link.is_none() {
            debug!("No live collector connection, reconnecting before send");
            match self.inner.open_link().await {
                Ok(l) => *link = Some(l),
                Err(e) => {
                    warn!("Reconnect before send failed: {}", e);
                    drop(link);
                    self.inner.spawn_reconnect();
                    return Err(TransportError::Disconnected);
                }
            }
        }

        let Some(active) = link.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        let err = match timeout(
            self.inner.config.send_timeout,
            active.sink.send(Message::Text(text.into())),
        )
        .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => TransportError::from(e),
            Err(_) => TransportError::Timeout,
        };

        warn!("Send on generation {} failed: {}", active.generation, err);
        *link = None;
        drop(link);
        self.inner.publish_lost();
        self.inner.spawn_reconnect();
        Err(err)
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(mut link) = self.inner.link.lock().await.take() {
            let _ = timeout(self.inner.config.send_timeout, link.sink.send(Message::Close(None))).await;
        }
        self.inner.state_tx.send_replace(ChannelState::Disconnected);
    }
}

impl Inner {
    /// Dial, greet, and start the reader for a new connection. The caller
    /// stores the returned link.
    async fn open_link(self: &Arc<Self>) -> Result<Link, TransportError> {
        let (ws, _) = timeout(self.config.send_timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (mut sink, stream) = ws.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let greeting = serde_json::json!({ "type": "connect" }).to_string();
        timeout(self.config.send_timeout, sink.send(Message::Text(greeting.into())))
            .await
            .map_err(|_| TransportError::Timeout)??;

        tokio::spawn(read_loop(Arc::clone(self), stream, generation));

        info!("Connected to collector at {} (generation {})", self.config.url, generation);
        self.state_tx.send_replace(ChannelState::Connected { generation });
        Ok(Link { sink, generation })
    }

    /// Called by a reader when its connection ends.
    async fn link_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut link = self.link.lock().await;
            match link.as_ref() {
                Some(l) if l.generation == generation => *link = None,
                // stale reader, or a failed send already cleared it
                _ => return,
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!("Collector connection {} lost", generation);
        self.publish_lost();
        self.spawn_reconnect();
    }

    /// Drop back to `Disconnected` unless the channel has already given up.
    fn publish_lost(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.is_abandoned() || *state == ChannelState::Disconnected {
                return false;
            }
            *state = ChannelState::Disconnected;
            true
        });
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.reconnect_loop().await });
    }

    /// Runs with `reconnecting` set and clears it on every exit. After a link
    /// is installed the flag is cleared before the link lock is released.
    async fn reconnect_loop(self: &Arc<Self>) {
        let policy = self.config.reconnect;
        let mut attempt = 1;

        while let Some(state) = policy.step(attempt) {
            self.state_tx.send_replace(state);
            tokio::time::sleep(policy.interval).await;

            if self.closed.load(Ordering::SeqCst) {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            let mut link = self.link.lock().await;
            if let Some(l) = link.as_ref() {
                // a send reconnected in the meantime
                self.state_tx.send_replace(ChannelState::Connected {
                    generation: l.generation,
                });
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            match self.open_link().await {
                Ok(l) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    *link = Some(l);
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => warn!(
                    "Reconnect attempt {}/{} failed: {}",
                    attempt, policy.max_attempts, e
                ),
            }
            attempt += 1;
        }

        error!(
            "Giving up on collector {} after {} attempts",
            self.config.url, policy.max_attempts
        );
        self.state_tx.send_replace(ChannelState::Abandoned);
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

async fn read_loop(inner: Arc<Inner>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => debug!("Collector: {}", text.as_str()),
            Ok(Message::Close(frame)) => {
                info!("Collector closed connection {}: {:?}", generation, frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Collector connection {} error: {}", generation, e);
                break;
            }
        }
    }
    inner.link_lost(generation).await;
}
