//! Registry actor
//!
//! The only shared mutable state in the server: identity → session.
//! A single task owns the map and processes commands one at a time, so every
//! check-then-mutate sequence (insert, rename, remove) is one critical section.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::AppError;
use crate::session::SessionHandle;
use crate::types::SessionId;

/// Commands sent from sessions and the fan-out loop to the Registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a new session under its current identity
    Insert {
        handle: SessionHandle,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Drop a session's entry, if it still owns `identity`
    Remove {
        identity: String,
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    /// Move a session from one identity to another
    Rename {
        id: SessionId,
        from: String,
        to: String,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Find the session registered under `identity`
    Lookup {
        identity: String,
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
    /// All registered sessions, sorted by identity
    Snapshot {
        reply: oneshot::Sender<Vec<SessionHandle>>,
    },
    /// Push a line into every registered mailbox
    FanOut {
        line: String,
        skip: Option<SessionId>,
    },
}

/// The Registry actor
///
/// Uses HashMap for O(1) lookups by identity.
pub struct Registry {
    /// Online sessions: identity -> handle
    sessions: HashMap<String, SessionHandle>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl Registry {
    /// Create a new Registry with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            sessions: HashMap::new(),
            receiver,
        }
    }

    /// Run the Registry event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("Registry shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Insert { handle, reply } => {
                let _ = reply.send(self.handle_insert(handle));
            }
            RegistryCommand::Remove {
                identity,
                id,
                reply,
            } => {
                let _ = reply.send(self.handle_remove(&identity, id));
            }
            RegistryCommand::Rename {
                id,
                from,
                to,
                reply,
            } => {
                let _ = reply.send(self.handle_rename(id, from, to));
            }
            RegistryCommand::Lookup { identity, reply } => {
                let _ = reply.send(self.sessions.get(&identity).cloned());
            }
            RegistryCommand::Snapshot { reply } => {
                let mut sessions: Vec<SessionHandle> = self.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| a.identity.cmp(&b.identity));
                let _ = reply.send(sessions);
            }
            RegistryCommand::FanOut { line, skip } => {
                self.handle_fan_out(line, skip);
            }
        }
    }

    fn handle_insert(&mut self, handle: SessionHandle) -> Result<(), AppError> {
        if self.sessions.contains_key(&handle.identity) {
            return Err(AppError::NameInUse(handle.identity));
        }

        debug!("Registered '{}' ({})", handle.identity, handle.id);
        self.sessions.insert(handle.identity.clone(), handle);
        debug!("Online sessions: {}", self.sessions.len());
        Ok(())
    }

    fn handle_remove(&mut self, identity: &str, id: SessionId) -> bool {
        let owned = match self.sessions.get(identity) {
            Some(handle) => handle.id == id,
            None => false,
        };

        let key = if owned {
            Some(identity.to_string())
        } else {
            // Entry may sit under a name the session never learned about
            self.sessions
                .iter()
                .find(|(_, handle)| handle.id == id)
                .map(|(key, _)| key.clone())
        };

        match key {
            Some(key) => {
                self.sessions.remove(&key);
                debug!("Online sessions: {}", self.sessions.len());
                true
            }
            None => false,
        }
    }

    fn handle_rename(&mut self, id: SessionId, from: String, to: String) -> Result<(), AppError> {
        if self.sessions.contains_key(&to) {
            return Err(AppError::NameInUse(to));
        }

        let Some(mut handle) = self.sessions.remove(&from) else {
            return Err(AppError::NotRegistered(from));
        };
        if handle.id != id {
            self.sessions.insert(from.clone(), handle);
            return Err(AppError::NotRegistered(from));
        }

        handle.identity = to.clone();
        self.sessions.insert(to, handle);
        Ok(())
    }

    fn handle_fan_out(&self, line: String, skip: Option<SessionId>) {
        for handle in self.sessions.values() {
            if Some(handle.id) == skip {
                continue;
            }
            // A terminated session is removed on its own shutdown path
            let _ = handle.send(line.clone());
        }
    }
}

/// Cloneable handle for talking to the Registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Create the actor and its handle; the caller spawns `Registry::run`
    pub fn channel(buffer: usize) -> (Self, Registry) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self::new(sender), Registry::new(receiver))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, AppError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| AppError::ChannelSend)?;
        response.await.map_err(|_| AppError::ChannelSend)
    }

    /// Register `handle` under its identity; `NameInUse` on collision
    pub async fn insert(&self, handle: SessionHandle) -> Result<(), AppError> {
        self.request(|reply| RegistryCommand::Insert { handle, reply })
            .await?
    }

    /// Remove session `id`, looked up under `identity` first; returns whether an entry was removed
    pub async fn remove(&self, identity: &str, id: SessionId) -> Result<bool, AppError> {
        let identity = identity.to_string();
        self.request(|reply| RegistryCommand::Remove {
            identity,
            id,
            reply,
        })
        .await
    }

    /// Atomically move session `id` from `from` to `to`
    pub async fn rename(&self, id: SessionId, from: &str, to: &str) -> Result<(), AppError> {
        let (from, to) = (from.to_string(), to.to_string());
        self.request(|reply| RegistryCommand::Rename {
            id,
            from,
            to,
            reply,
        })
        .await?
    }

    pub async fn lookup(&self, identity: &str) -> Result<Option<SessionHandle>, AppError> {
        let identity = identity.to_string();
        self.request(|reply| RegistryCommand::Lookup { identity, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionHandle>, AppError> {
        self.request(|reply| RegistryCommand::Snapshot { reply }).await
    }

    /// Deliver `line` to every registered session except `skip`
    pub async fn fan_out(&self, line: String, skip: Option<SessionId>) -> Result<(), AppError> {
        self.sender
            .send(RegistryCommand::FanOut { line, skip })
            .await
            .map_err(|_| AppError::ChannelSend)
    }
}
