//! Server configuration
//!
//! Parsed from command-line flags with environment variable fallbacks.

use std::time::Duration;

use clap::Parser;

/// Default bind address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8888";

/// Default idle window before a silent session is evicted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default maximum inbound line length in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default registry command channel capacity
pub const DEFAULT_REGISTRY_BUFFER: usize = 256;

/// Line-oriented TCP chat server
#[derive(Parser, Clone, Debug)]
#[command(name = "tcp_chat_server", version, about = "Line-oriented TCP chat server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Seconds of silence before a client is evicted
    #[arg(long, env = "CHAT_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// Maximum inbound line length in bytes
    #[arg(long, env = "CHAT_MAX_LINE_LENGTH", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Capacity of the registry command channel
    #[arg(long, env = "CHAT_REGISTRY_BUFFER", default_value_t = DEFAULT_REGISTRY_BUFFER)]
    pub registry_buffer: usize,
}

impl Config {
    /// Idle window as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            registry_buffer: DEFAULT_REGISTRY_BUFFER,
        }
    }
}
