use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use meshroom_core::{
    Action, AdminMessage, ChannelId, ChannelMessage, ChatMessage, FileId, FileInfo, FileMessage,
    MAX_CHAT_TEXT_BYTES, PeerId, Role, RoomId, UserInfo, WireMessage, encode_message,
    generate_message_id, now_unix_ms,
};
use tracing::{debug, info, warn};

use crate::{
    channels::{Channel, ChannelStore},
    config::{BanList, SessionConfig},
    error::SessionError,
    registry::{Peer, SessionRegistry},
    transfer::{FileTransferEngine, ReceivedFile},
    transport::{ScheduledTimer, SessionEvent, Timer, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Bootstrapping,
    AwaitingIdentity,
    ConnectingToHost,
    Connected,
    ReElecting,
    Terminated,
}

/// Everything the session wants the embedding UI or persistence layer to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    RoomReady {
        room_code: RoomId,
        local_id: PeerId,
        role: Role,
    },
    PeerJoined(Peer),
    PeerLeft {
        peer_id: PeerId,
        name: String,
    },
    HostChanged {
        host_id: PeerId,
        epoch: u64,
    },
    RoleChanged {
        peer_id: PeerId,
        role: Role,
    },
    Chat(ChatMessage),
    ChannelCreated {
        channel_id: ChannelId,
        name: String,
    },
    ChannelDeleted {
        channel_id: ChannelId,
    },
    /// The active channel changed; `history` is that channel's backlog for redisplay.
    ActiveChannel {
        channel_id: ChannelId,
        history: Vec<ChatMessage>,
    },
    HistoryLoaded {
        channels: usize,
    },
    FileOffered(FileInfo),
    FileProgress {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    FileReceived(ReceivedFile),
    FileSent {
        file_id: FileId,
    },
    TransferStalled {
        file_id: FileId,
        name: String,
    },
    /// The ban list of `room_code` changed and should be persisted.
    BansChanged {
        room_code: RoomId,
        bans: BanList,
    },
    TimedOut {
        peer_id: PeerId,
        until_ms: u64,
    },
    TimeoutLifted {
        peer_id: PeerId,
    },
    Error(String),
    Terminated {
        reason: String,
    },
}

/// State of one participant in one room.
///
/// All inputs arrive through [`Session::handle_event`] or the local
/// operations; outputs are collected with [`Session::take_notices`] and
/// [`Session::take_timers`]. Nothing here blocks or spawns.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) state: ConnectionState,
    pub(crate) local_id: PeerId,
    /// Invite code the room was created or joined with; keys the ban list.
    pub(crate) room_code: RoomId,
    /// Identity of the current host. Starts equal to the room code and
    /// follows host re-elections.
    pub(crate) room_id: RoomId,
    pub(crate) role: Role,
    pub(crate) epoch: u64,
    /// Set once the first host link has opened (or the room was created).
    pub(crate) joined: bool,
    pub(crate) signaling_attempts: u32,
    /// Room codes tried by the current `create_room`.
    pub(crate) room_code_attempts: u32,
    pub(crate) registry: SessionRegistry,
    pub(crate) channels: ChannelStore,
    pub(crate) transfers: FileTransferEngine,
    pub(crate) pending: VecDeque<WireMessage>,
    notices: Vec<SessionNotice>,
    timers: Vec<ScheduledTimer>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("room_id", &self.room_id)
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            state: ConnectionState::Idle,
            local_id: String::new(),
            room_code: String::new(),
            room_id: String::new(),
            role: Role::Member,
            epoch: 0,
            joined: false,
            signaling_attempts: 0,
            room_code_attempts: 0,
            registry: SessionRegistry::default(),
            channels: ChannelStore::new(),
            transfers: FileTransferEngine::new(),
            pending: VecDeque::new(),
            notices: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.registry.peers().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.registry.peer(peer_id)
    }

    pub fn linked_peers(&self) -> Vec<PeerId> {
        self.registry.open_peer_ids()
    }

    pub fn channels(&self) -> &[Channel] {
        self.channels.channels()
    }

    pub fn active_channel(&self) -> &str {
        self.channels.active()
    }

    pub fn history(&self, channel_id: &str) -> &[ChatMessage] {
        self.channels.history(channel_id)
    }

    pub fn bans(&self) -> &BanList {
        self.registry.bans()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn take_timers(&mut self) -> Vec<ScheduledTimer> {
        std::mem::take(&mut self.timers)
    }

    /// Processes one transport event or timer to completion.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IdentityOpen { identity } => self.on_identity_open(&identity),
            SessionEvent::IdentityUnavailable { identity, reason } => {
                self.on_identity_unavailable(identity, reason)
            }
            SessionEvent::SignalingDisconnected => self.on_signaling_disconnected(),
            SessionEvent::Incoming { link } => self.on_incoming(link),
            SessionEvent::LinkOpen { link_id, peer_id } => self.on_link_open(link_id, &peer_id),
            SessionEvent::LinkData {
                link_id,
                peer_id,
                payload,
            } => self.on_link_data(link_id, &peer_id, payload),
            SessionEvent::LinkClosed { link_id, peer_id } => {
                self.on_link_closed(link_id, &peer_id)
            }
            SessionEvent::LinkError {
                link_id,
                peer_id,
                reason,
            } => {
                warn!(peer_id = %peer_id, link = %link_id, "link error: {}", reason);
                self.on_link_closed(link_id, &peer_id);
            }
            SessionEvent::Timer(timer) => self.on_timer(timer),
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<ChatMessage, SessionError> {
        self.ensure_in_room()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if text.len() > MAX_CHAT_TEXT_BYTES {
            return Err(SessionError::MessageTooLarge);
        }
        if let Some(until) = self.registry.muted_until(&self.local_id) {
            return Err(SessionError::Muted {
                remaining_ms: until.saturating_sub(now_unix_ms()),
            });
        }

        let message = ChatMessage {
            id: generate_message_id(),
            author_id: self.local_id.clone(),
            author: self.config.display_name.clone(),
            text: text.to_owned(),
            timestamp: now_unix_ms(),
            channel: self.channels.active().to_owned(),
        };
        self.channels.append(message.clone());
        self.broadcast(WireMessage::Chat(message.clone()));
        self.notify(SessionNotice::Chat(message.clone()));
        Ok(message)
    }

    pub fn create_channel(&mut self, name: &str) -> Result<ChannelId, SessionError> {
        self.ensure_in_room()?;
        if !self.role.permits(Action::CreateChannel) {
            return Err(SessionError::PermissionDenied(Action::CreateChannel));
        }
        let channel = self.channels.create(name)?;
        let (channel_id, name) = (channel.id.clone(), channel.name.clone());
        info!(channel_id = %channel_id, name = %name, "channel created");

        self.broadcast(WireMessage::Channel(ChannelMessage::Create {
            channel_id: channel_id.clone(),
            name: name.clone(),
        }));
        self.notify(SessionNotice::ChannelCreated {
            channel_id: channel_id.clone(),
            name,
        });
        self.switch_channel(&channel_id)?;
        Ok(channel_id)
    }

    pub fn delete_channel(&mut self, channel_id: &str) -> Result<(), SessionError> {
        self.ensure_in_room()?;
        if channel_id == meshroom_core::DEFAULT_CHANNEL_ID {
            return Err(SessionError::DefaultChannelUndeletable);
        }
        if !self.role.permits(Action::DeleteChannel) {
            return Err(SessionError::PermissionDenied(Action::DeleteChannel));
        }
        let was_active = self.channels.active() == channel_id;
        self.channels.remove(channel_id)?;
        info!(channel_id = %channel_id, "channel deleted");

        self.broadcast(WireMessage::Channel(ChannelMessage::Delete {
            channel_id: channel_id.to_owned(),
        }));
        self.notify(SessionNotice::ChannelDeleted {
            channel_id: channel_id.to_owned(),
        });
        if was_active {
            self.notify_active_channel();
        }
        Ok(())
    }

    /// Returns `Ok(false)` when `channel_id` is already active.
    pub fn switch_channel(&mut self, channel_id: &str) -> Result<bool, SessionError> {
        let changed = self.channels.switch(channel_id)?;
        if changed {
            self.notify_active_channel();
        }
        Ok(changed)
    }

    /// Announces a file and starts streaming its chunks, one per
    /// `chunk_send_interval`.
    pub fn send_file(
        &mut self,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<FileInfo, SessionError> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let info = self
            .transfers
            .start_outgoing(&self.local_id, name, mime, data)?;
        info!(
            file_id = %info.file_id,
            name = %info.name,
            size = info.size,
            chunks = info.total_chunks,
            "sending file"
        );
        self.broadcast(WireMessage::File(FileMessage::Info(info.clone())));
        self.schedule(
            self.config.chunk_send_interval,
            Timer::SendNextChunk {
                file_id: info.file_id.clone(),
            },
        );
        Ok(info)
    }

    pub fn promote(&mut self, peer_id: &str) -> Result<(), SessionError> {
        self.moderate(AdminMessage::Promote {
            target_id: peer_id.to_owned(),
            actor_id: self.local_id.clone(),
        })
    }

    pub fn demote(&mut self, peer_id: &str) -> Result<(), SessionError> {
        self.moderate(AdminMessage::Demote {
            target_id: peer_id.to_owned(),
            actor_id: self.local_id.clone(),
        })
    }

    pub fn kick(&mut self, peer_id: &str) -> Result<(), SessionError> {
        self.moderate(AdminMessage::Kick {
            target_id: peer_id.to_owned(),
            actor_id: self.local_id.clone(),
        })
    }

    pub fn ban(&mut self, peer_id: &str) -> Result<(), SessionError> {
        let target_name = self
            .registry
            .peer(peer_id)
            .map(|peer| peer.name.clone())
            .ok_or_else(|| SessionError::UnknownPeer(peer_id.to_owned()))?;
        self.moderate(AdminMessage::Ban {
            target_id: peer_id.to_owned(),
            target_name,
            actor_id: self.local_id.clone(),
        })
    }

    pub fn unban(&mut self, name: &str) -> Result<(), SessionError> {
        self.moderate(AdminMessage::Unban {
            target_name: name.to_owned(),
            actor_id: self.local_id.clone(),
        })
    }

    pub fn timeout(&mut self, peer_id: &str, duration: Duration) -> Result<(), SessionError> {
        self.moderate(AdminMessage::Timeout {
            target_id: peer_id.to_owned(),
            actor_id: self.local_id.clone(),
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Closes every link, drops all room state and returns to `Idle`.
    pub fn leave(&mut self) {
        if self.state == ConnectionState::Idle {
            return;
        }
        info!(room_id = %self.room_id, "leaving room");
        self.registry.close_all();
        self.transport.shutdown();
        self.reset_room_state(Role::Member, String::new(), String::new());
        self.state = ConnectionState::Idle;
    }

    fn moderate(&mut self, message: AdminMessage) -> Result<(), SessionError> {
        self.ensure_in_room()?;
        let Some(action) = message.action() else {
            return Ok(());
        };
        let permitted = match admin_target(&message) {
            Some(target) => {
                let target_role = self
                    .registry
                    .role_of(target)
                    .ok_or_else(|| SessionError::UnknownPeer(target.to_owned()))?;
                self.role.can_moderate(action, target_role)
            }
            None => self.role.permits(action),
        };
        if !permitted {
            return Err(SessionError::PermissionDenied(action));
        }

        self.broadcast(WireMessage::Admin(message.clone()));
        self.apply_admin(message);
        Ok(())
    }

    fn ensure_in_room(&self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Terminated => Err(SessionError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Sends to every link when hosting, otherwise to the host link only.
    /// Members queue messages while the host link is not open; the queue is
    /// flushed when it opens.
    pub(crate) fn broadcast(&mut self, message: WireMessage) {
        if self.is_host() {
            let payload = match encode_message(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("failed to encode {} message: {}", message.kind(), err);
                    return;
                }
            };
            let sent = self.registry.send_all_except(None, &payload);
            debug!(kind = message.kind(), recipients = sent, "broadcast");
            return;
        }

        if !self.registry.is_open(&self.room_id) {
            debug!(kind = message.kind(), queued = self.pending.len() + 1, "no host link; queued");
            self.pending.push_back(message);
            return;
        }
        self.send_to(&self.room_id, &message);
    }

    pub(crate) fn send_to(&self, peer_id: &str, message: &WireMessage) {
        let payload = match encode_message(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode {} message: {}", message.kind(), err);
                return;
            }
        };
        if let Err(err) = self.registry.send_to(peer_id, payload) {
            warn!(peer_id = %peer_id, kind = message.kind(), "send failed: {}", err);
        }
    }

    pub(crate) fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        info!(count = self.pending.len(), "flushing queued messages");
        while let Some(message) = self.pending.pop_front() {
            self.broadcast(message);
            if !self.is_host() && !self.registry.is_open(&self.room_id) {
                break;
            }
        }
    }

    pub(crate) fn local_user_info(&self) -> UserInfo {
        UserInfo {
            peer_id: self.local_id.clone(),
            name: self.config.display_name.clone(),
            avatar: self.config.avatar.clone(),
            role: self.role,
        }
    }

    pub(crate) fn notify(&mut self, notice: SessionNotice) {
        self.notices.push(notice);
    }

    pub(crate) fn notify_error(&mut self, err: &SessionError) {
        self.notices.push(SessionNotice::Error(err.to_string()));
    }

    pub(crate) fn notify_active_channel(&mut self) {
        let channel_id = self.channels.active().to_owned();
        let history = self.channels.history(&channel_id).to_vec();
        self.notify(SessionNotice::ActiveChannel {
            channel_id,
            history,
        });
    }

    pub(crate) fn notify_bans(&mut self) {
        self.config
            .bans
            .insert(self.room_code.clone(), self.registry.bans().clone());
        self.notify(SessionNotice::BansChanged {
            room_code: self.room_code.clone(),
            bans: self.registry.bans().clone(),
        });
    }

    pub(crate) fn schedule(&mut self, delay: Duration, timer: Timer) {
        self.timers.push(ScheduledTimer { delay, timer });
    }

    /// Clears everything tied to the current room; name, avatar and
    /// persisted ban lists survive.
    pub(crate) fn reset_room_state(&mut self, role: Role, room_code: RoomId, local_id: PeerId) {
        let bans = self
            .config
            .bans
            .get(&room_code)
            .cloned()
            .unwrap_or_default();
        self.registry.reset(bans);
        self.channels = ChannelStore::new();
        self.transfers.clear();
        self.pending.clear();
        self.timers.clear();
        self.role = role;
        self.room_id = room_code.clone();
        self.room_code = room_code;
        self.local_id = local_id;
        self.epoch = 0;
        self.joined = false;
        self.signaling_attempts = 0;
    }

    pub(crate) fn terminate(&mut self, reason: String) {
        if self.state == ConnectionState::Terminated {
            return;
        }
        warn!(room_id = %self.room_id, "session terminated: {}", reason);
        self.registry.close_all();
        self.transport.shutdown();
        self.transfers.clear();
        self.pending.clear();
        self.state = ConnectionState::Terminated;
        self.notify(SessionNotice::Terminated { reason });
    }
}

pub(crate) fn admin_target(message: &AdminMessage) -> Option<&str> {
    match message {
        AdminMessage::Promote { target_id, .. }
        | AdminMessage::Demote { target_id, .. }
        | AdminMessage::Kick { target_id, .. }
        | AdminMessage::Ban { target_id, .. }
        | AdminMessage::Timeout { target_id, .. } => Some(target_id),
        AdminMessage::Unban { .. } | AdminMessage::Unknown => None,
    }
}
