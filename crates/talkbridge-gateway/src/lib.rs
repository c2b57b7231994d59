pub mod channel;
pub mod state;

use std::future::Future;

use talkbridge_types::events::Envelope;
use tokio::sync::watch;

pub use channel::{ChannelConfig, TransportChannel};
pub use state::{ChannelState, ReconnectPolicy};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("collector connection is down")]
    Disconnected,
    #[error("reconnection abandoned after {0} attempts")]
    Abandoned(u32),
    #[error("collector did not respond in time")]
    Timeout,
    #[error("websocket error: {0}")]
    Protocol(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where assembled envelopes go. The relay only depends on this trait, so the
/// loops can be driven against an in-memory sink.
pub trait EventSink: Send + Sync {
    /// Deliver one envelope. An `Err` means the collector did not get it.
    fn deliver(&self, envelope: &Envelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Connection state updates. `Abandoned` is fatal to the caller.
    fn status(&self) -> watch::Receiver<ChannelState>;
}

impl EventSink for TransportChannel {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send(envelope).await
    }

    fn status(&self) -> watch::Receiver<ChannelState> {
        self.subscribe()
    }
}
