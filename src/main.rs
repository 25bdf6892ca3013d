//! Line-oriented TCP Chat Server - Entry Point
//!
//! Parses configuration, starts the server and accepts connections.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tcp_chat_server::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_chat_server=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tcp_chat_server=info")),
        )
        .init();

    let config = Config::parse();

    // Start TCP listener; failing to bind is the only fatal error
    let listener = TcpListener::bind(&config.addr).await?;

    let server = Server::start(config);
    info!(
        "Idle timeout {}s, max line length {} bytes",
        server.config().idle_timeout_secs,
        server.config().max_line_length
    );

    server.serve(listener).await;
    Ok(())
}
