//! Command router
//!
//! Turns one inbound line into a `who` listing, a rename, a direct message or
//! a broadcast. Command errors become a notice to the requester only.

use tracing::{debug, info};

use crate::error::AppError;
use crate::message::{Command, ServerMessage};
use crate::session::Session;

/// Handle one line from `session`
///
/// Only fatal errors (registry or broadcaster gone) are returned.
pub async fn handle(session: &mut Session, line: &str) -> Result<(), AppError> {
    // Empty lines keep the session alive but carry no content
    if line.is_empty() {
        return Ok(());
    }

    let result = match Command::parse(line) {
        Command::Who => handle_who(session).await,
        Command::Rename { name } => handle_rename(session, name).await,
        Command::To { target, content } => handle_direct(session, target, content).await,
        Command::Chat { content } => handle_chat(session, content),
    };

    match result {
        Err(e) if e.is_notice() => {
            debug!("Rejected command from {}: {}", session.id(), e);
            let _ = session.send(e.into());
            Ok(())
        }
        other => other,
    }
}

/// List every online session back to the requester
async fn handle_who(session: &Session) -> Result<(), AppError> {
    let online = session.context().registry.snapshot().await?;

    for entry in online {
        let _ = session.send(ServerMessage::WhoEntry {
            address: entry.address,
            identity: entry.identity,
        });
    }
    Ok(())
}

/// Change identity, unless someone else already has the new one
async fn handle_rename(session: &mut Session, name: String) -> Result<(), AppError> {
    if name.is_empty() {
        return Err(AppError::EmptyName);
    }

    session
        .context()
        .registry
        .rename(session.id(), session.identity(), &name)
        .await?;

    info!("Session {} renamed '{}' -> '{}'", session.id(), session.identity(), name);
    session.set_identity(name.clone());
    let _ = session.send(ServerMessage::Renamed { identity: name });
    Ok(())
}

/// Deliver a message to one named session's mailbox
async fn handle_direct(session: &Session, target: String, content: String) -> Result<(), AppError> {
    if target.is_empty() {
        return Err(AppError::MalformedDirect);
    }

    let Some(recipient) = session.context().registry.lookup(&target).await? else {
        return Err(AppError::UnknownUser(target));
    };

    if content.is_empty() {
        return Err(AppError::EmptyContent);
    }

    let msg = ServerMessage::Direct {
        from: session.identity().to_string(),
        content,
    };
    // Recipient may have disconnected since the lookup
    let _ = recipient.send(msg.to_string());
    Ok(())
}

/// Broadcast a chat line to everyone, the author included
fn handle_chat(session: &Session, content: String) -> Result<(), AppError> {
    let msg = ServerMessage::Chat {
        address: session.address().to_string(),
        identity: session.identity().to_string(),
        content,
    };
    session
        .context()
        .broadcaster
        .publish(msg.to_string())
        .map_err(|_| AppError::ChannelSend)
}
