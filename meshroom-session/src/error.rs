use meshroom_core::{Action, CoreError, MAX_CHANNEL_NAME_LEN, MAX_CHAT_TEXT_BYTES, PeerId};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid room code {0:?}: expected 4 letters or digits")]
    InvalidRoomCode(String),
    #[error("channel name must not be empty")]
    EmptyChannelName,
    #[error("channel name exceeds {MAX_CHANNEL_NAME_LEN} characters")]
    ChannelNameTooLong,
    #[error("a channel named {0:?} already exists")]
    DuplicateChannel(String),
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("the default channel cannot be deleted")]
    DefaultChannelUndeletable,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("message exceeds {MAX_CHAT_TEXT_BYTES} bytes")]
    MessageTooLarge,
    #[error("file is empty")]
    EmptyFile,
    #[error("file too large ({size} bytes); limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("too many file transfers in progress")]
    TooManyTransfers,
    #[error("permission denied: {0:?}")]
    PermissionDenied(Action),
    #[error("you are timed out for another {remaining_ms} ms")]
    Muted { remaining_ms: u64 },
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("not connected to a room")]
    NotConnected,
    #[error("timed out connecting to {0}")]
    ConnectionTimeout(PeerId),
    #[error("lost the signaling server after {0} reconnect attempts")]
    SignalingLost(u32),
    #[error("identity {identity} unavailable: {reason}")]
    IdentityUnavailable { identity: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Core(#[from] CoreError),
}
