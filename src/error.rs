//! Error types for the chat server
//!
//! Defines application-level errors and mailbox send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (session termination) and
/// command errors (send a notice back to the requesting client).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error while reading from the peer (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - registry or broadcaster task is gone)
    #[error("Channel send error")]
    ChannelSend,

    /// Requested identity is already registered
    #[error("Name in use: {0}")]
    NameInUse(String),

    /// `rename|` without a name
    #[error("Empty name")]
    EmptyName,

    /// `to|` without a target
    #[error("Malformed direct message")]
    MalformedDirect,

    /// `to|` naming an identity nobody holds
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// `to|target|` without content
    #[error("Empty content")]
    EmptyContent,

    /// Session is not (or no longer) registered under this identity
    #[error("Not registered: {0}")]
    NotRegistered(String),
}

impl AppError {
    /// Whether this error is answered with a notice while the session stays open
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            AppError::NameInUse(_)
                | AppError::EmptyName
                | AppError::MalformedDirect
                | AppError::UnknownUser(_)
                | AppError::EmptyContent
        )
    }
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
