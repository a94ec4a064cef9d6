use std::{collections::BTreeMap, collections::HashMap, time::Duration};

use meshroom_core::RoomId;

/// Ban list of one room: banned display name -> ban time (unix ms).
pub type BanList = BTreeMap<String, u64>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub display_name: String,
    pub avatar: Option<String>,
    /// Persisted ban lists keyed by room id; the active room's list is
    /// loaded on create/join.
    pub bans: HashMap<RoomId, BanList>,
    pub connect_timeout: Duration,
    pub history_settle_delay: Duration,
    pub chunk_send_interval: Duration,
    pub transfer_idle_timeout: Duration,
    pub max_signaling_reconnects: u32,
    /// Fresh room codes a new host tries before giving up on collisions.
    pub max_room_code_attempts: u32,
    pub reconnect_backoff_base: Duration,
}

impl SessionConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        self.reconnect_backoff_base
            .saturating_mul(1_u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_owned(),
            avatar: None,
            bans: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
            history_settle_delay: Duration::from_millis(500),
            chunk_send_interval: Duration::from_millis(5),
            transfer_idle_timeout: Duration::from_secs(30),
            max_signaling_reconnects: 3,
            max_room_code_attempts: 5,
            reconnect_backoff_base: Duration::from_millis(200),
        }
    }
}
