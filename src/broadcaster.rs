//! Broadcast channel
//!
//! Every broadcast line goes through one unbounded channel with a single
//! consumer (`FanOut`), which hands lines to the registry one at a time.
//! All sessions therefore see broadcasts in the same order.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::SendError;
use crate::registry::RegistryHandle;
use crate::types::SessionId;

/// One published line
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub line: String,
    /// Session that must not receive this line (a joiner's own join notice)
    pub skip: Option<SessionId>,
}

/// Publishing side of the broadcast channel
///
/// Cloneable; `publish` never waits, so any number of sessions can publish concurrently.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: mpsc::UnboundedSender<Broadcast>,
}

impl Broadcaster {
    /// Create the publishing handle and the fan-out loop that consumes it
    pub fn channel(registry: RegistryHandle) -> (Self, FanOut) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, FanOut { receiver, registry })
    }

    /// Queue a line for every registered session
    pub fn publish(&self, line: String) -> Result<(), SendError> {
        self.send(Broadcast { line, skip: None })
    }

    /// Queue a line for every registered session except `skip`
    pub fn publish_except(&self, line: String, skip: SessionId) -> Result<(), SendError> {
        self.send(Broadcast {
            line,
            skip: Some(skip),
        })
    }

    fn send(&self, broadcast: Broadcast) -> Result<(), SendError> {
        self.sender
            .send(broadcast)
            .map_err(|_| SendError::ChannelClosed)
    }
}

/// The single consumer of the broadcast channel
pub struct FanOut {
    receiver: mpsc::UnboundedReceiver<Broadcast>,
    registry: RegistryHandle,
}

impl FanOut {
    /// Run until every `Broadcaster` is dropped or the registry goes away
    pub async fn run(mut self) {
        info!("Broadcast fan-out started");

        while let Some(Broadcast { line, skip }) = self.receiver.recv().await {
            if let Err(e) = self.registry.fan_out(line, skip).await {
                warn!("Registry unavailable, stopping fan-out: {}", e);
                break;
            }
        }

        info!("Broadcast fan-out shutting down");
    }
}
