//! Session: one accepted connection
//!
//! A session owns its outbound mailbox and its identity. Other components
//! only ever hold a `SessionHandle`, which can append to the mailbox.

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info};

use crate::codec::ChatCodec;
use crate::error::{AppError, SendError};
use crate::message::ServerMessage;
use crate::router;
use crate::server::ServerContext;
use crate::types::SessionId;

/// Receiving end of a session's mailbox, drained by the writer task
pub type Mailbox = mpsc::UnboundedReceiver<String>;

/// Registry entry for a session
///
/// Cheap to clone; holds the producer side of the session's mailbox.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub address: String,
    pub identity: String,
    mailbox: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    /// Append a line to this session's mailbox
    ///
    /// Never blocks. Fails only if the session has already terminated.
    pub fn send(&self, line: String) -> Result<(), SendError> {
        self.mailbox
            .send(line)
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Standalone handle and mailbox, not tied to any session
    #[cfg(test)]
    pub(crate) fn detached(address: &str) -> (Self, Mailbox) {
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: SessionId::new(),
            address: address.to_string(),
            identity: address.to_string(),
            mailbox,
        };
        (handle, receiver)
    }
}

/// Connected client state
pub struct Session {
    id: SessionId,
    address: String,
    identity: String,
    outbox: mpsc::UnboundedSender<String>,
    ctx: ServerContext,
    registered: bool,
}

impl Session {
    /// Create a session and its mailbox without a writer attached
    ///
    /// The identity starts out as the remote address.
    pub fn new(address: String, ctx: ServerContext) -> (Self, Mailbox) {
        let (outbox, mailbox) = mpsc::unbounded_channel();
        let session = Self {
            id: SessionId::new(),
            identity: address.clone(),
            address,
            outbox,
            ctx,
            registered: false,
        };
        (session, mailbox)
    }

    /// Create a session and start the writer task draining its mailbox into `writer`
    pub fn create<W>(writer: W, address: String, ctx: ServerContext) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (session, mailbox) = Self::new(address, ctx);
        let id = session.id;
        let writer = tokio::spawn(write_loop(id, writer, mailbox));
        (session, writer)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_identity(&mut self, identity: String) {
        self.identity = identity;
    }

    /// Registry entry describing this session as it is right now
    pub fn entry(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            address: self.address.clone(),
            identity: self.identity.clone(),
            mailbox: self.outbox.clone(),
        }
    }

    /// Send a message to this session's own client
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.outbox
            .send(msg.to_string())
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Register in the registry and tell everyone else about it
    ///
    /// Fails with `NameInUse` if another session already holds this identity.
    pub async fn announce_online(&mut self) -> Result<(), AppError> {
        self.ctx.registry.insert(self.entry()).await?;
        self.registered = true;
        info!("Session {} online as '{}'", self.id, self.identity);

        let notice = ServerMessage::Online {
            address: self.address.clone(),
            identity: self.identity.clone(),
        };
        self.ctx
            .broadcaster
            .publish_except(notice.to_string(), self.id)
            .map_err(|_| AppError::ChannelSend)
    }

    /// Deregister and announce the departure
    ///
    /// Only the first call after a successful `announce_online` has any effect.
    pub async fn announce_offline(&mut self) -> Result<(), AppError> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;

        self.ctx.registry.remove(&self.identity, self.id).await?;
        info!("Session {} ('{}') offline", self.id, self.identity);

        let notice = ServerMessage::Offline {
            address: self.address.clone(),
            identity: self.identity.clone(),
        };
        self.ctx
            .broadcaster
            .publish(notice.to_string())
            .map_err(|_| AppError::ChannelSend)
    }

    /// Interpret one inbound line
    pub async fn handle(&mut self, line: &str) -> Result<(), AppError> {
        router::handle(self, line).await
    }
}

/// Drain the mailbox to the peer, one message per line
///
/// Ends when every producer is gone or a write fails; shuts the writer down on exit.
async fn write_loop<W>(id: SessionId, writer: W, mut mailbox: Mailbox)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut sink = FramedWrite::new(writer, ChatCodec::default());

    while let Some(line) = mailbox.recv().await {
        if let Err(e) = sink.send(line).await {
            debug!("Write failed for {}: {}", id, e);
            return;
        }
    }

    let _ = SinkExt::<String>::close(&mut sink).await;
    debug!("Write task ended for {}", id);
}
