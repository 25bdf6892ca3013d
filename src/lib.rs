//! Line-oriented TCP Chat Server Library
//!
//! Clients connect over TCP, are registered under an identity (initially their
//! address) and exchange broadcast or directed text lines.
//!
//! # Features
//! - `who`: list online users
//! - `rename|<name>`: change identity, rejected if the name is taken
//! - `to|<name>|<content>`: direct message to one user
//! - Any other line: broadcast chat message
//! - Join/leave announcements
//! - Idle eviction after a configurable silence window
//!
//! # Architecture
//! - `Registry` is an actor owning identity → session; every mutation is one message
//! - `Broadcaster` feeds a single `FanOut` loop, so broadcasts share one total order
//! - Each connection runs a reader loop, a writer task draining its mailbox,
//!   and an idle watchdog
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tcp_chat_server::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8888").await.unwrap();
//!     Server::start(Config::default()).serve(listener).await;
//! }
//! ```

pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod types;
pub mod watchdog;

// Re-export main types for convenience
pub use broadcaster::Broadcaster;
pub use codec::{ChatCodec, Inbound};
pub use config::Config;
pub use connection::{handle_connection, Termination};
pub use error::{AppError, SendError};
pub use message::{Command, ServerMessage};
pub use registry::{Registry, RegistryHandle};
pub use server::{Server, ServerContext};
pub use session::{Session, SessionHandle};
pub use types::SessionId;
