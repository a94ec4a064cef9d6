//! Inbound message routing: host relay fan-out, then per-type dispatch.

use bytes::Bytes;
use meshroom_core::{
    AdminMessage, ChannelMessage, ChatMessage, FileId, FileMessage,
    HistorySnapshot, Role, SystemMessage, UserInfo, WireMessage, decode_message, now_unix_ms,
};
use tracing::{debug, info, warn};

use crate::{
    session::{ConnectionState, Session, SessionNotice, admin_target},
    transfer::{IdleCheck, TransferState},
    transport::{LinkId, Timer},
};

impl Session {
    pub(crate) fn on_link_data(&mut self, link_id: LinkId, from: &str, payload: Bytes) {
        if !self.registry.link_matches(from, link_id) || !self.registry.is_open(from) {
            debug!(peer_id = %from, link = %link_id, "data on stale link dropped");
            return;
        }
        if self.state == ConnectionState::Terminated {
            return;
        }
        let message = match decode_message(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer_id = %from, "dropping undecodable payload: {}", err);
                return;
            }
        };
        self.route(message, &payload, from);
    }

    /// Relays (when hosting) and then dispatches one inbound message.
    ///
    /// The relay forwards the original bytes to every open link except the
    /// sender's before any local state changes.
    pub fn route(&mut self, message: WireMessage, raw: &Bytes, from: &str) {
        if self.is_host() && message.is_relayable() {
            if let WireMessage::System(SystemMessage::UserInfo(info)) = &message
                && self.registry.is_banned(&info.name)
            {
                self.reject_banned(from, info);
                return;
            }
            let relayed = self.registry.send_all_except(Some(from), raw);
            debug!(kind = message.kind(), from = %from, relayed, "relayed");
        }

        match message {
            WireMessage::Chat(chat) => self.on_chat(chat),
            WireMessage::System(system) => self.on_system(system, from),
            WireMessage::Admin(admin) => self.on_admin(admin),
            WireMessage::Channel(channel) => self.on_channel(channel),
            WireMessage::File(file) => self.on_file(file),
            WireMessage::History(snapshot) => self.on_history(snapshot, from),
            WireMessage::Unknown => {
                warn!(from = %from, "ignoring message of unknown type");
            }
        }
    }

    /// Tells a banned newcomer why, drops its link and has the members that
    /// were already told to dial it forget it again.
    fn reject_banned(&mut self, from: &str, info: &UserInfo) {
        warn!(peer_id = %from, name = %info.name, "closing link from banned peer");
        self.send_to(
            from,
            &WireMessage::Admin(AdminMessage::Ban {
                target_id: from.to_owned(),
                target_name: info.name.clone(),
                actor_id: self.local_id.clone(),
            }),
        );
        if let Some(link) = self.registry.take_link(from) {
            link.close();
        }
        self.registry.remove_peer(from);
        self.broadcast(WireMessage::System(SystemMessage::PeerDisconnect {
            peer_id: from.to_owned(),
            name: info.name.clone(),
        }));
    }

    fn on_chat(&mut self, chat: ChatMessage) {
        if chat.author_id == self.local_id {
            debug!(id = %chat.id, "ignoring echo of own message");
            return;
        }
        if self.registry.muted_until(&chat.author_id).is_some() {
            warn!(author = %chat.author_id, "dropping chat from timed-out peer");
            return;
        }
        let channel = self.channels.append(chat.clone());
        self.notify(SessionNotice::Chat(ChatMessage { channel, ..chat }));
    }

    fn on_system(&mut self, system: SystemMessage, from: &str) {
        match system {
            SystemMessage::UserInfo(info) => self.on_user_info(info),
            SystemMessage::NewPeerConnected { peer_id } => {
                if self.is_host() {
                    warn!(peer_id = %peer_id, from = %from, "host ignores peer announcement");
                    return;
                }
                debug!(peer_id = %peer_id, "peer announced; forming mesh link");
                self.dial(&peer_id);
            }
            SystemMessage::PeerDisconnect { peer_id, .. } => {
                if peer_id == self.local_id {
                    return;
                }
                self.peer_departed(&peer_id);
            }
            SystemMessage::HostChange { host_id, epoch } => self.on_host_change(host_id, epoch),
            SystemMessage::Unknown => {
                warn!(from = %from, "ignoring unknown system action");
            }
        }
    }

    fn on_user_info(&mut self, info: UserInfo) {
        if info.peer_id == self.local_id {
            return;
        }
        if self.registry.upsert_peer(&info) {
            info!(peer_id = %info.peer_id, name = %info.name, role = %info.role, "peer joined");
            if let Some(peer) = self.registry.peer(&info.peer_id).cloned() {
                self.notify(SessionNotice::PeerJoined(peer));
            }
        }
    }

    fn on_channel(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Create { channel_id, name } => {
                if self.channels.insert_remote(&channel_id, &name) {
                    info!(channel_id = %channel_id, name = %name, "channel created by peer");
                    self.notify(SessionNotice::ChannelCreated { channel_id, name });
                }
            }
            ChannelMessage::Delete { channel_id } => {
                let was_active = self.channels.active() == channel_id;
                match self.channels.remove(&channel_id) {
                    Ok(_) => {
                        info!(channel_id = %channel_id, "channel deleted by peer");
                        self.notify(SessionNotice::ChannelDeleted { channel_id });
                        if was_active {
                            self.notify_active_channel();
                        }
                    }
                    Err(err) => warn!(channel_id = %channel_id, "ignoring channel delete: {}", err),
                }
            }
            ChannelMessage::Unknown => warn!("ignoring unknown channel action"),
        }
    }

    fn on_history(&mut self, snapshot: HistorySnapshot, from: &str) {
        if self.is_host() {
            warn!(from = %from, "host ignores history snapshot");
            return;
        }
        let channels = snapshot.channels.len();
        self.channels.load_snapshot(snapshot);
        info!(from = %from, channels, "history loaded");
        self.notify(SessionNotice::HistoryLoaded { channels });
        self.notify_active_channel();
    }

    fn on_file(&mut self, message: FileMessage) {
        match message {
            FileMessage::Info(info) => {
                if info.sender_id == self.local_id {
                    return;
                }
                match self.transfers.begin_incoming(info.clone()) {
                    Ok(activity) => {
                        info!(file_id = %info.file_id, name = %info.name, size = info.size, "incoming file");
                        self.schedule(
                            self.config.transfer_idle_timeout,
                            Timer::TransferIdle {
                                file_id: info.file_id.clone(),
                                activity,
                            },
                        );
                        self.notify(SessionNotice::FileOffered(info));
                    }
                    Err(err) => warn!("rejecting file offer: {}", err),
                }
            }
            FileMessage::Chunk(chunk) => match self.transfers.accept_chunk(&chunk) {
                Ok(TransferState::Collecting { received, total }) => {
                    self.notify(SessionNotice::FileProgress {
                        file_id: chunk.file_id,
                        received,
                        total,
                    });
                }
                Ok(TransferState::Complete(file)) => {
                    info!(file_id = %file.file_id, name = %file.name, bytes = file.bytes.len(), "file received");
                    self.notify(SessionNotice::FileReceived(file));
                }
                Err(err) => warn!("dropping file chunk: {}", err),
            },
            FileMessage::Unknown => warn!("ignoring unknown file action"),
        }
    }

    pub(crate) fn on_transfer_idle(&mut self, file_id: FileId, activity: u64) {
        match self.transfers.check_idle(&file_id, activity) {
            IdleCheck::Gone => {}
            IdleCheck::Active(marker) => self.schedule(
                self.config.transfer_idle_timeout,
                Timer::TransferIdle {
                    file_id,
                    activity: marker,
                },
            ),
            IdleCheck::Stalled(info) => {
                warn!(file_id = %info.file_id, name = %info.name, "file transfer stalled");
                self.notify(SessionNotice::TransferStalled {
                    file_id: info.file_id,
                    name: info.name,
                });
            }
        }
    }

    pub(crate) fn send_next_chunk(&mut self, file_id: FileId) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Terminated
        ) {
            return;
        }
        let Some((chunk, last)) = self.transfers.next_chunk(&file_id) else {
            return;
        };
        self.broadcast(WireMessage::File(FileMessage::Chunk(chunk)));
        if last {
            info!(file_id = %file_id, "file sent");
            self.notify(SessionNotice::FileSent { file_id });
        } else {
            self.schedule(
                self.config.chunk_send_interval,
                Timer::SendNextChunk { file_id },
            );
        }
    }

    fn on_admin(&mut self, message: AdminMessage) {
        let (Some(action), Some(actor_id)) = (message.action(), message.actor_id()) else {
            warn!("ignoring unknown admin action");
            return;
        };
        let actor_role = self.role_for(actor_id);
        let permitted = match (actor_role, admin_target(&message)) {
            (None, _) => false,
            (Some(actor), Some(target)) => match self.role_for(target) {
                Some(target_role) => actor.can_moderate(action, target_role),
                None => actor.permits(action),
            },
            (Some(actor), None) => actor.permits(action),
        };
        if !permitted {
            warn!(actor = %actor_id, ?action, "ignoring unauthorized admin action");
            return;
        }
        self.apply_admin(message);
    }

    fn role_for(&self, peer_id: &str) -> Option<Role> {
        if peer_id == self.local_id {
            return Some(self.role);
        }
        self.registry.role_of(peer_id)
    }

    /// Applies an already authorized admin action to local state.
    pub(crate) fn apply_admin(&mut self, message: AdminMessage) {
        match message {
            AdminMessage::Promote { target_id, .. } => self.set_role(&target_id, Role::Admin),
            AdminMessage::Demote { target_id, .. } => self.set_role(&target_id, Role::Member),
            AdminMessage::Kick {
                target_id,
                actor_id,
            } => {
                if target_id == self.local_id {
                    self.terminate(format!("kicked by {}", self.name_of(&actor_id)));
                    return;
                }
                info!(peer_id = %target_id, actor = %actor_id, "peer kicked");
                self.expel(&target_id);
            }
            AdminMessage::Ban {
                target_id,
                target_name,
                actor_id,
            } => {
                if target_id == self.local_id {
                    self.terminate(format!("banned by {}", self.name_of(&actor_id)));
                    return;
                }
                let name = if target_name.is_empty() {
                    self.name_of(&target_id)
                } else {
                    target_name
                };
                info!(peer_id = %target_id, name = %name, actor = %actor_id, "peer banned");
                self.registry.ban(&name, now_unix_ms());
                self.expel(&target_id);
                self.notify_bans();
            }
            AdminMessage::Unban { target_name, .. } => {
                if self.registry.unban(&target_name) {
                    info!(name = %target_name, "ban lifted");
                    self.notify_bans();
                }
            }
            AdminMessage::Timeout {
                target_id,
                duration_ms,
                ..
            } => {
                let until_ms = now_unix_ms().saturating_add(duration_ms);
                info!(peer_id = %target_id, duration_ms, "peer timed out");
                self.registry.mute(&target_id, until_ms);
                self.schedule(
                    std::time::Duration::from_millis(duration_ms),
                    Timer::MuteExpired {
                        peer_id: target_id.clone(),
                        until_ms,
                    },
                );
                self.notify(SessionNotice::TimedOut {
                    peer_id: target_id,
                    until_ms,
                });
            }
            AdminMessage::Unknown => {}
        }
    }

    /// Hosts drop a kicked or banned peer outright. Members only forget it;
    /// their mesh link closes when the host's `peer_disconnect` arrives, so
    /// the target hears the action from the host first.
    fn expel(&mut self, peer_id: &str) {
        if self.is_host() {
            self.peer_departed(peer_id);
            return;
        }
        if let Some(peer) = self.registry.remove_peer(peer_id) {
            self.notify(SessionNotice::PeerLeft {
                peer_id: peer.id,
                name: peer.name,
            });
        }
    }

    fn set_role(&mut self, peer_id: &str, role: Role) {
        let changed = if peer_id == self.local_id {
            if self.role == Role::Host {
                return;
            }
            self.role = role;
            true
        } else {
            self.registry.set_role(peer_id, role)
        };
        if changed {
            info!(peer_id = %peer_id, role = %role, "role changed");
            self.notify(SessionNotice::RoleChanged {
                peer_id: peer_id.to_owned(),
                role,
            });
        }
    }

    fn name_of(&self, peer_id: &str) -> String {
        self.registry
            .peer(peer_id)
            .map(|peer| peer.name.clone())
            .unwrap_or_else(|| peer_id.to_owned())
    }
}
