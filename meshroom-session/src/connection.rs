//! Room bootstrap, link lifecycle, mesh formation and host re-election.

use meshroom_core::{
    PeerId, Role, RoomId, SystemMessage, WireMessage, encode_message, generate_peer_id,
    generate_room_code, normalize_room_code,
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    registry::Attach,
    session::{ConnectionState, Session, SessionNotice},
    transport::{Link, LinkId, Timer},
};

impl Session {
    /// Starts hosting a fresh room. The generated code doubles as this
    /// peer's transport identity. If the code turns out to be taken another
    /// one is tried; the code finally opened is reported in
    /// [`SessionNotice::RoomReady`].
    pub fn create_room(&mut self) -> Result<RoomId, SessionError> {
        let code = generate_room_code();
        self.room_code_attempts = 1;
        self.bootstrap(Role::Host, code.clone(), code.clone())?;
        Ok(code)
    }

    pub fn join_room(&mut self, code: &str) -> Result<(), SessionError> {
        self.join_room_as(code, &generate_peer_id())
    }

    /// Joins `code` using a caller-chosen local identity.
    pub fn join_room_as(&mut self, code: &str, local_id: &str) -> Result<(), SessionError> {
        let code = normalize_room_code(code)
            .map_err(|_| SessionError::InvalidRoomCode(code.to_owned()))?;
        self.bootstrap(Role::Member, code, local_id.to_owned())
    }

    fn bootstrap(
        &mut self,
        role: Role,
        room_code: RoomId,
        local_id: PeerId,
    ) -> Result<(), SessionError> {
        if self.state != ConnectionState::Idle {
            self.registry.close_all();
            self.transport.shutdown();
        }
        self.state = ConnectionState::Bootstrapping;
        self.reset_room_state(role, room_code, local_id);
        info!(
            room_code = %self.room_code,
            local_id = %self.local_id,
            role = %self.role,
            "bootstrapping session"
        );

        if let Err(err) = self.transport.open_identity(&self.local_id) {
            self.state = ConnectionState::Idle;
            return Err(err.into());
        }
        self.state = ConnectionState::AwaitingIdentity;
        Ok(())
    }

    pub(crate) fn on_identity_open(&mut self, identity: &str) {
        if identity != self.local_id {
            debug!(identity = %identity, "ignoring stale identity confirmation");
            return;
        }
        let restored = self.signaling_attempts > 0;
        self.signaling_attempts = 0;

        match self.state {
            ConnectionState::AwaitingIdentity if self.is_host() => {
                self.state = ConnectionState::Connected;
                self.joined = true;
                info!(room_code = %self.room_code, "room open");
                self.notify(SessionNotice::RoomReady {
                    room_code: self.room_code.clone(),
                    local_id: self.local_id.clone(),
                    role: self.role,
                });
            }
            ConnectionState::AwaitingIdentity => {
                self.state = ConnectionState::ConnectingToHost;
                let host = self.room_id.clone();
                self.dial(&host);
            }
            _ if restored => info!(identity = %identity, "signaling restored"),
            _ => {}
        }
    }

    pub(crate) fn on_identity_unavailable(&mut self, identity: String, reason: String) {
        if identity != self.local_id {
            return;
        }
        if self.is_host()
            && self.state == ConnectionState::AwaitingIdentity
            && self.room_code_attempts < self.config.max_room_code_attempts
        {
            self.retry_room_code(&identity, &reason);
            return;
        }
        let err = SessionError::IdentityUnavailable { identity, reason };
        self.notify_error(&err);
        self.terminate(err.to_string());
    }

    fn retry_room_code(&mut self, taken: &str, reason: &str) {
        self.room_code_attempts += 1;
        let code = generate_room_code();
        warn!(
            taken = %taken,
            room_code = %code,
            attempt = self.room_code_attempts,
            "room code unavailable ({}); trying another",
            reason
        );
        self.reset_room_state(Role::Host, code.clone(), code);
        if let Err(err) = self.transport.open_identity(&self.local_id) {
            let err = SessionError::from(err);
            self.notify_error(&err);
            self.terminate(err.to_string());
        }
    }

    pub(crate) fn on_signaling_disconnected(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Terminated
        ) {
            return;
        }
        self.signaling_attempts += 1;
        let attempt = self.signaling_attempts;
        if attempt > self.config.max_signaling_reconnects {
            let err = SessionError::SignalingLost(self.config.max_signaling_reconnects);
            self.notify_error(&err);
            self.terminate(err.to_string());
            return;
        }
        let delay = self.config.reconnect_backoff(attempt);
        warn!(attempt, ?delay, "signaling disconnected; scheduling reconnect");
        self.schedule(delay, Timer::SignalingReconnect { attempt });
    }

    fn on_signaling_reconnect(&mut self, attempt: u32) {
        if attempt != self.signaling_attempts
            || matches!(
                self.state,
                ConnectionState::Idle | ConnectionState::Terminated
            )
        {
            return;
        }
        info!(attempt, "reconnecting to signaling");
        if let Err(err) = self.transport.reconnect() {
            warn!(attempt, "signaling reconnect failed: {}", err);
            self.on_signaling_disconnected();
        }
    }

    pub(crate) fn on_incoming(&mut self, link: Box<dyn Link>) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Bootstrapping | ConnectionState::Terminated
        ) || link.peer_id() == self.local_id
        {
            link.close();
            return;
        }
        let peer_id = link.peer_id().to_owned();
        info!(peer_id = %peer_id, link = %link.id(), "incoming link");
        match self.registry.attach_link(link, &peer_id) {
            Attach::Attached => {}
            Attach::Replaced(old) => old.close(),
            Attach::Rejected(new) => new.close(),
        }
    }

    /// Dials `peer_id` unless a link to it already exists.
    pub(crate) fn dial(&mut self, peer_id: &str) {
        if peer_id == self.local_id || self.registry.has_link(peer_id) {
            debug!(peer_id = %peer_id, "already linked; not dialing");
            return;
        }
        let link = match self.transport.connect(peer_id) {
            Ok(link) => link,
            Err(err) => {
                warn!(peer_id = %peer_id, "dial failed: {}", err);
                if !self.is_host() && peer_id == self.room_id {
                    self.host_link_lost(peer_id.to_owned());
                }
                return;
            }
        };
        let link_id = link.id();
        info!(peer_id = %peer_id, link = %link_id, "dialing");
        match self.registry.attach_link(link, &self.local_id) {
            Attach::Attached => {}
            Attach::Replaced(old) => old.close(),
            Attach::Rejected(new) => {
                new.close();
                return;
            }
        }
        self.schedule(
            self.config.connect_timeout,
            Timer::ConnectTimeout {
                peer_id: peer_id.to_owned(),
                link_id,
            },
        );
    }

    pub(crate) fn on_link_open(&mut self, link_id: LinkId, peer_id: &str) {
        if !self.registry.mark_open(peer_id, link_id) {
            debug!(peer_id = %peer_id, link = %link_id, "open for unknown link");
            return;
        }
        info!(peer_id = %peer_id, link = %link_id, "link open");
        self.send_to(
            peer_id,
            &WireMessage::System(SystemMessage::UserInfo(self.local_user_info())),
        );

        if self.is_host() {
            self.welcome(peer_id, link_id);
            return;
        }
        if peer_id == self.room_id {
            let first = !self.joined;
            self.joined = true;
            self.state = ConnectionState::Connected;
            if first {
                info!(room_code = %self.room_code, host = %peer_id, "joined room");
                self.notify(SessionNotice::RoomReady {
                    room_code: self.room_code.clone(),
                    local_id: self.local_id.clone(),
                    role: self.role,
                });
            }
            self.flush_pending();
        }
    }

    /// Host-side introduction of a newly linked peer: tell it who is here,
    /// tell everyone else to dial it, and push history once it settles.
    fn welcome(&mut self, peer_id: &str, link_id: LinkId) {
        let others: Vec<_> = self
            .registry
            .peers()
            .filter(|peer| peer.id != peer_id)
            .map(|peer| peer.user_info())
            .collect();
        for info in others {
            self.send_to(peer_id, &WireMessage::System(SystemMessage::UserInfo(info)));
        }
        if self.epoch > 0 {
            self.send_to(
                peer_id,
                &WireMessage::System(SystemMessage::HostChange {
                    host_id: self.local_id.clone(),
                    epoch: self.epoch,
                }),
            );
        }

        let announce = WireMessage::System(SystemMessage::NewPeerConnected {
            peer_id: peer_id.to_owned(),
        });
        match encode_message(&announce) {
            Ok(payload) => {
                let notified = self.registry.send_all_except(Some(peer_id), &payload);
                debug!(peer_id = %peer_id, notified, "announced new peer");
            }
            Err(err) => warn!("failed to encode peer announcement: {}", err),
        }

        self.schedule(
            self.config.history_settle_delay,
            Timer::HistorySync {
                peer_id: peer_id.to_owned(),
                link_id,
            },
        );
    }

    pub(crate) fn on_link_closed(&mut self, link_id: LinkId, peer_id: &str) {
        if self.registry.detach_link(peer_id, link_id).is_none() {
            debug!(peer_id = %peer_id, link = %link_id, "close for stale link");
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Terminated
        ) {
            return;
        }
        info!(peer_id = %peer_id, link = %link_id, "link closed");
        if !self.is_host() && peer_id == self.room_id {
            self.host_link_lost(peer_id.to_owned());
            return;
        }
        self.peer_departed(peer_id);
    }

    pub(crate) fn peer_departed(&mut self, peer_id: &str) {
        if let Some(link) = self.registry.take_link(peer_id) {
            link.close();
        }
        let Some(peer) = self.registry.remove_peer(peer_id) else {
            return;
        };
        info!(peer_id = %peer.id, name = %peer.name, "peer left");
        if self.is_host() {
            self.broadcast(WireMessage::System(SystemMessage::PeerDisconnect {
                peer_id: peer.id.clone(),
                name: peer.name.clone(),
            }));
        }
        self.notify(SessionNotice::PeerLeft {
            peer_id: peer.id,
            name: peer.name,
        });
    }

    fn host_link_lost(&mut self, host_id: PeerId) {
        if !self.joined {
            let err = SessionError::Transport(crate::TransportError::PeerUnavailable(host_id));
            self.notify_error(&err);
            self.terminate(err.to_string());
            return;
        }
        warn!(host = %host_id, "lost host link");
        if let Some(link) = self.registry.take_link(&host_id) {
            link.close();
        }
        if let Some(peer) = self.registry.remove_peer(&host_id) {
            self.notify(SessionNotice::PeerLeft {
                peer_id: peer.id,
                name: peer.name,
            });
        }
        self.elect_host();
    }

    /// Every survivor runs the same computation: the smallest id among the
    /// known peers and itself becomes host under the next epoch.
    fn elect_host(&mut self) {
        self.state = ConnectionState::ReElecting;
        let mut candidates = self.registry.peer_ids();
        candidates.push(self.local_id.clone());
        candidates.sort();
        let winner = candidates[0].clone();
        self.epoch += 1;
        info!(
            winner = %winner,
            epoch = self.epoch,
            candidates = ?candidates,
            "host re-election"
        );

        if winner == self.local_id {
            self.become_host();
        } else {
            self.follow_host(winner);
        }
    }

    fn become_host(&mut self) {
        self.role = Role::Host;
        self.room_id = self.local_id.clone();
        self.state = ConnectionState::Connected;
        info!(epoch = self.epoch, "promoted to host");

        self.broadcast(WireMessage::System(SystemMessage::HostChange {
            host_id: self.local_id.clone(),
            epoch: self.epoch,
        }));
        self.notify(SessionNotice::RoleChanged {
            peer_id: self.local_id.clone(),
            role: Role::Host,
        });
        self.notify(SessionNotice::HostChanged {
            host_id: self.local_id.clone(),
            epoch: self.epoch,
        });
        self.flush_pending();
    }

    fn follow_host(&mut self, host_id: PeerId) {
        self.room_id = host_id.clone();
        self.registry.set_role(&host_id, Role::Host);
        self.notify(SessionNotice::HostChanged {
            host_id: host_id.clone(),
            epoch: self.epoch,
        });

        if self.registry.is_open(&host_id) {
            self.state = ConnectionState::Connected;
            self.flush_pending();
        } else {
            self.state = ConnectionState::ConnectingToHost;
            self.dial(&host_id);
        }
    }

    /// Applies a `host_change` claim. Higher epochs win; within one epoch the
    /// smaller host id wins; anything else is stale.
    pub(crate) fn on_host_change(&mut self, host_id: PeerId, epoch: u64) {
        let newer = epoch > self.epoch
            || (epoch == self.epoch && host_id.as_str() <= self.room_id.as_str());
        if !newer {
            warn!(
                claimed = %host_id,
                epoch,
                current = %self.room_id,
                current_epoch = self.epoch,
                "ignoring stale host claim"
            );
            return;
        }
        if host_id == self.room_id && epoch == self.epoch {
            return;
        }
        self.epoch = epoch;
        if host_id == self.local_id {
            return;
        }
        if self.is_host() {
            warn!(new_host = %host_id, epoch, "stepping down as host");
            self.role = Role::Admin;
            self.notify(SessionNotice::RoleChanged {
                peer_id: self.local_id.clone(),
                role: Role::Admin,
            });
        }
        info!(host = %host_id, epoch, "host changed");
        self.follow_host(host_id);
    }

    pub(crate) fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ConnectTimeout { peer_id, link_id } => self.on_connect_timeout(peer_id, link_id),
            Timer::HistorySync { peer_id, link_id } => self.on_history_sync(&peer_id, link_id),
            Timer::SignalingReconnect { attempt } => self.on_signaling_reconnect(attempt),
            Timer::MuteExpired { peer_id, until_ms } => {
                if self.registry.unmute_if(&peer_id, until_ms) {
                    info!(peer_id = %peer_id, "timeout lifted");
                    self.notify(SessionNotice::TimeoutLifted { peer_id });
                }
            }
            Timer::TransferIdle { file_id, activity } => {
                self.on_transfer_idle(file_id, activity)
            }
            Timer::SendNextChunk { file_id } => self.send_next_chunk(file_id),
        }
    }

    fn on_connect_timeout(&mut self, peer_id: PeerId, link_id: LinkId) {
        if !self.registry.link_matches(&peer_id, link_id) || self.registry.is_open(&peer_id) {
            return;
        }
        if let Some(link) = self.registry.detach_link(&peer_id, link_id) {
            link.close();
        }
        if self.is_host() || peer_id != self.room_id {
            debug!(peer_id = %peer_id, "mesh link timed out");
            return;
        }
        if !self.joined {
            let err = SessionError::ConnectionTimeout(peer_id);
            self.notify_error(&err);
            self.terminate(err.to_string());
            return;
        }
        self.host_link_lost(peer_id);
    }

    fn on_history_sync(&mut self, peer_id: &str, link_id: LinkId) {
        if !self.is_host()
            || !self.registry.link_matches(peer_id, link_id)
            || !self.registry.is_open(peer_id)
        {
            return;
        }
        let snapshot = self.channels.snapshot();
        debug!(peer_id = %peer_id, channels = snapshot.channels.len(), "pushing history");
        self.send_to(peer_id, &WireMessage::History(snapshot));
    }
}
