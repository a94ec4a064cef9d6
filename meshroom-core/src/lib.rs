use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const ROOM_CODE_LEN: usize = 4;
pub const ROOM_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const DEFAULT_CHANNEL_ID: &str = "default";
pub const DEFAULT_CHANNEL_NAME: &str = "general";
pub const MAX_CHANNEL_NAME_LEN: usize = 64;
pub const MAX_CHAT_TEXT_BYTES: usize = 16 * 1024;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_HISTORY_MESSAGES: usize = 500;
pub const FILE_CHUNK_BYTES: usize = 16 * 1024;
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_TOTAL_CHUNKS: u32 = (MAX_FILE_BYTES as usize).div_ceil(FILE_CHUNK_BYTES) as u32;
pub const MAX_INFLIGHT_TRANSFERS: usize = 8;
const PEER_ID_BYTES: usize = 8;

pub type PeerId = String;
pub type RoomId = String;
pub type ChannelId = String;
pub type FileId = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("room code must be {ROOM_CODE_LEN} letters or digits, got {0:?}")]
    InvalidRoomCode(String),
    #[error("invite link is not a valid url: {0}")]
    InvalidInvite(String),
    #[error("invite link has no room code fragment")]
    MissingInviteFragment,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("file chunk data is not valid base64: {0}")]
    ChunkEncoding(String),
}

/// Role of a peer inside a room. The host is implicitly an admin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Admin,
    #[default]
    Member,
}

/// Privileged operations gated by [`Role::permits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateChannel,
    DeleteChannel,
    Promote,
    Demote,
    Kick,
    Ban,
    Unban,
    Timeout,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Host | Role::Admin)
    }

    pub fn permits(self, action: Action) -> bool {
        match action {
            Action::CreateChannel => true,
            Action::DeleteChannel
            | Action::Kick
            | Action::Ban
            | Action::Unban
            | Action::Timeout => self.is_admin(),
            Action::Promote | Action::Demote => self == Role::Host,
        }
    }

    /// Whether `self` may apply a moderation `action` to a peer holding `target`.
    ///
    /// Nobody moderates the host, and admins only moderate plain members.
    pub fn can_moderate(self, action: Action, target: Role) -> bool {
        if !self.permits(action) || target == Role::Host {
            return false;
        }
        self == Role::Host || target == Role::Member
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Admin => write!(f, "admin"),
            Role::Member => write!(f, "member"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub author_id: PeerId,
    pub author: String,
    pub text: String,
    pub timestamp: u64,
    #[serde(default = "default_channel_id")]
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub peer_id: PeerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemMessage {
    UserInfo(UserInfo),
    NewPeerConnected {
        peer_id: PeerId,
    },
    PeerDisconnect {
        peer_id: PeerId,
        #[serde(default)]
        name: String,
    },
    HostChange {
        host_id: PeerId,
        #[serde(default)]
        epoch: u64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminMessage {
    Promote {
        target_id: PeerId,
        actor_id: PeerId,
    },
    Demote {
        target_id: PeerId,
        actor_id: PeerId,
    },
    Kick {
        target_id: PeerId,
        actor_id: PeerId,
    },
    Ban {
        target_id: PeerId,
        #[serde(default)]
        target_name: String,
        actor_id: PeerId,
    },
    Unban {
        target_name: String,
        actor_id: PeerId,
    },
    Timeout {
        target_id: PeerId,
        actor_id: PeerId,
        duration_ms: u64,
    },
    #[serde(other)]
    Unknown,
}

impl AdminMessage {
    pub fn actor_id(&self) -> Option<&str> {
        match self {
            AdminMessage::Promote { actor_id, .. }
            | AdminMessage::Demote { actor_id, .. }
            | AdminMessage::Kick { actor_id, .. }
            | AdminMessage::Ban { actor_id, .. }
            | AdminMessage::Unban { actor_id, .. }
            | AdminMessage::Timeout { actor_id, .. } => Some(actor_id),
            AdminMessage::Unknown => None,
        }
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            AdminMessage::Promote { .. } => Some(Action::Promote),
            AdminMessage::Demote { .. } => Some(Action::Demote),
            AdminMessage::Kick { .. } => Some(Action::Kick),
            AdminMessage::Ban { .. } => Some(Action::Ban),
            AdminMessage::Unban { .. } => Some(Action::Unban),
            AdminMessage::Timeout { .. } => Some(Action::Timeout),
            AdminMessage::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChannelMessage {
    Create { channel_id: ChannelId, name: String },
    Delete { channel_id: ChannelId },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: FileId,
    pub sender_id: PeerId,
    pub name: String,
    #[serde(default)]
    pub mime: String,
    pub size: u64,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: FileId,
    pub index: u32,
    /// Raw chunk bytes, base64 encoded.
    pub data: String,
}

impl FileChunk {
    pub fn new(file_id: FileId, index: u32, raw: &[u8]) -> Self {
        Self {
            file_id,
            index,
            data: base64::engine::general_purpose::STANDARD.encode(raw),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, CoreError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|err| CoreError::ChunkEncoding(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileMessage {
    Info(FileInfo),
    Chunk(FileChunk),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HistorySnapshot {
    #[serde(default)]
    pub channels: Vec<ChannelSnapshot>,
}

/// Envelope for everything exchanged over a peer link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Chat(ChatMessage),
    System(SystemMessage),
    Admin(AdminMessage),
    Channel(ChannelMessage),
    File(FileMessage),
    History(HistorySnapshot),
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Chat(_) => "chat",
            WireMessage::System(_) => "system",
            WireMessage::Admin(_) => "admin",
            WireMessage::Channel(_) => "channel",
            WireMessage::File(_) => "file",
            WireMessage::History(_) => "history",
            WireMessage::Unknown => "unknown",
        }
    }

    /// Whether a host forwards this message to the other peers.
    ///
    /// Everything except `system` is relayed; of the system actions only
    /// `user_info` and `peer_disconnect` travel beyond the first hop.
    pub fn is_relayable(&self) -> bool {
        match self {
            WireMessage::System(system) => matches!(
                system,
                SystemMessage::UserInfo(_) | SystemMessage::PeerDisconnect { .. }
            ),
            _ => true,
        }
    }
}

pub fn encode_message(message: &WireMessage) -> Result<Bytes, CoreError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_message(payload: &[u8]) -> Result<WireMessage, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn generate_room_code() -> RoomId {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Lowercases `input`, then checks it against `^[a-z0-9]{4}$`. Surrounding
/// whitespace is not stripped.
pub fn normalize_room_code(input: &str) -> Result<RoomId, CoreError> {
    let code = input.to_ascii_lowercase();
    let valid = code.len() == ROOM_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !valid {
        return Err(CoreError::InvalidRoomCode(input.to_owned()));
    }
    Ok(code)
}

pub fn invite_link(origin: &str, room_code: &str) -> String {
    format!("{}/#{}", origin.trim_end_matches('/'), room_code)
}

/// Extracts and validates the room code carried in an invite link's fragment.
pub fn parse_invite(link: &str) -> Result<RoomId, CoreError> {
    let url = Url::parse(link.trim()).map_err(|err| CoreError::InvalidInvite(err.to_string()))?;
    let fragment = url
        .fragment()
        .filter(|f| !f.is_empty())
        .ok_or(CoreError::MissingInviteFragment)?;
    normalize_room_code(fragment)
}

pub fn generate_peer_id() -> PeerId {
    let bytes: [u8; PEER_ID_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

pub fn generate_channel_id() -> ChannelId {
    let bytes: [u8; 6] = rand::rng().random();
    format!("ch-{}", hex::encode(bytes))
}

pub fn generate_message_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

pub fn derive_transfer_id(sender_id: &str, file_name: &str, now_ms: u64) -> FileId {
    let nonce: u32 = rand::rng().random();
    let digest = Sha256::digest(format!("{sender_id}:{now_ms}:{nonce}:{file_name}").as_bytes());
    hex::encode(&digest[..16])
}

pub fn total_chunks_for(size: u64) -> u32 {
    size.div_ceil(FILE_CHUNK_BYTES as u64) as u32
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn default_channel_id() -> ChannelId {
    DEFAULT_CHANNEL_ID.to_owned()
}
