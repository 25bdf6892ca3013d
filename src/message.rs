//! Line protocol definitions
//!
//! Plain-text protocol: every client line is either a command
//! (`who`, `rename|<name>`, `to|<target>|<content>`) or a chat message,
//! and every server line is rendered through `ServerMessage`'s `Display`.

use std::fmt;

use crate::error::AppError;

/// Client → Server line
///
/// Prefixes are matched case-sensitively, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List online users
    Who,
    /// Change identity
    Rename { name: String },
    /// Direct message to one identity
    To { target: String, content: String },
    /// Anything else: broadcast to everyone
    Chat { content: String },
}

impl Command {
    /// Parse one inbound line (already stripped of its terminator)
    pub fn parse(line: &str) -> Self {
        if line == "who" {
            return Command::Who;
        }

        if let Some(rest) = line.strip_prefix("rename|") {
            let name = rest.split('|').next().unwrap_or_default();
            return Command::Rename {
                name: name.to_string(),
            };
        }

        if let Some(rest) = line.strip_prefix("to|") {
            let mut fields = rest.splitn(2, '|');
            let target = fields.next().unwrap_or_default();
            let content = fields.next().unwrap_or_default();
            return Command::To {
                target: target.to_string(),
                content: content.to_string(),
            };
        }

        Command::Chat {
            content: line.to_string(),
        }
    }
}

/// Server → Client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Someone joined
    Online { address: String, identity: String },
    /// Someone left
    Offline { address: String, identity: String },
    /// One entry of a `who` listing
    WhoEntry { address: String, identity: String },
    /// Rename accepted
    Renamed { identity: String },
    /// Direct message from another user
    Direct { from: String, content: String },
    /// Broadcast chat line
    Chat {
        address: String,
        identity: String,
        content: String,
    },
    /// Final line before an idle eviction
    Evicted,
    /// Requested name is already taken
    NameInUse,
    /// `rename|` syntax error
    RenameFormat,
    /// `to|` syntax error
    DirectFormat,
    /// `to|` target does not exist
    UnknownUser,
    /// `to|` without content
    EmptyContent,
    /// Inbound line exceeded the length limit and was dropped
    LineTooLong,
    /// Anything the client cannot act on
    InternalError,
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Online { address, identity } => {
                write!(f, "[{}]{}:已上线", address, identity)
            }
            ServerMessage::Offline { address, identity } => {
                write!(f, "[{}]{}:下线", address, identity)
            }
            ServerMessage::WhoEntry { address, identity } => {
                write!(f, "[{}]{}:在线...", address, identity)
            }
            ServerMessage::Renamed { identity } => write!(f, "您已经更新用户名:{}", identity),
            ServerMessage::Direct { from, content } => write!(f, "{}对您说:{}", from, content),
            ServerMessage::Chat {
                address,
                identity,
                content,
            } => write!(f, "[{}]{}:{}", address, identity, content),
            ServerMessage::Evicted => f.write_str("你被踢了"),
            ServerMessage::NameInUse => f.write_str("当前用户名被使用"),
            ServerMessage::RenameFormat => {
                f.write_str("消息格式不正确，请使用 \"rename|张三\"格式。")
            }
            ServerMessage::DirectFormat => {
                f.write_str("消息格式不正确，请使用 \"to|张三|你好啊\"格式。")
            }
            ServerMessage::UnknownUser => f.write_str("该用户名不存在"),
            ServerMessage::EmptyContent => f.write_str("无消息内容，请重发"),
            ServerMessage::LineTooLong => f.write_str("消息过长，已丢弃"),
            ServerMessage::InternalError => f.write_str("服务器内部错误"),
        }
    }
}

/// Convert AppError to the notice shown to the requesting client
impl From<&AppError> for ServerMessage {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::NameInUse(_) => ServerMessage::NameInUse,
            AppError::EmptyName => ServerMessage::RenameFormat,
            AppError::MalformedDirect => ServerMessage::DirectFormat,
            AppError::UnknownUser(_) => ServerMessage::UnknownUser,
            AppError::EmptyContent => ServerMessage::EmptyContent,
            // Fatal errors end the session; the notice is best effort
            _ => ServerMessage::InternalError,
        }
    }
}

impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        ServerMessage::from(&err)
    }
}
