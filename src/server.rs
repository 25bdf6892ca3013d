//! Chat server
//!
//! Owns the Registry actor and the broadcast fan-out loop for its whole
//! lifetime, and turns accepted connections into session tasks.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::connection::{handle_connection, Termination};
use crate::error::AppError;
use crate::registry::RegistryHandle;

/// What a session may reach of the server
///
/// Handed to every session instead of a reference to the `Server` itself.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub registry: RegistryHandle,
    pub broadcaster: Broadcaster,
    pub config: Arc<Config>,
}

/// The chat server
///
/// The background loops stop on their own once the server and every
/// session have dropped their handles.
pub struct Server {
    ctx: ServerContext,
}

impl Server {
    /// Spawn the Registry actor and the single fan-out loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Self {
        let (registry, actor) = RegistryHandle::channel(config.registry_buffer);
        tokio::spawn(actor.run());

        let (broadcaster, fan_out) = Broadcaster::channel(registry.clone());
        tokio::spawn(fan_out.run());

        info!("ChatServer started");

        Self {
            ctx: ServerContext {
                registry,
                broadcaster,
                config: Arc::new(config),
            },
        }
    }

    pub fn context(&self) -> ServerContext {
        self.ctx.clone()
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Start a session for an already-accepted stream
    pub fn spawn_connection<S>(
        &self,
        stream: S,
        address: String,
    ) -> JoinHandle<Result<Termination, AppError>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ctx = self.context();
        tokio::spawn(async move {
            let result = handle_connection(stream, address, ctx).await;
            if let Err(e) = &result {
                error!("Connection handler error: {}", e);
            }
            result
        })
    }

    /// Accept connections forever
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Chat server listening on {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    self.spawn_connection(stream, addr.to_string());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
