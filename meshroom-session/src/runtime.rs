//! Tokio driver: owns a [`Session`], feeds it transport events and local
//! commands one at a time, arms its timers and forwards its notices.

use std::time::Duration;

use bytes::Bytes;
use meshroom_core::{ChannelId, PeerId, Role, RoomId};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    config::BanList,
    error::SessionError,
    registry::Peer,
    session::{ConnectionState, Session, SessionNotice},
    transport::{ScheduledTimer, SessionEvent},
};

/// Local operations accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    CreateRoom {
        reply: oneshot::Sender<Result<RoomId, SessionError>>,
    },
    JoinRoom {
        code: String,
        local_id: Option<PeerId>,
    },
    SendChat(String),
    CreateChannel(String),
    DeleteChannel(ChannelId),
    SwitchChannel(ChannelId),
    SendFile {
        name: String,
        mime: String,
        data: Bytes,
    },
    Promote(PeerId),
    Demote(PeerId),
    Kick(PeerId),
    Ban(PeerId),
    Unban(String),
    Timeout {
        peer_id: PeerId,
        duration: Duration,
    },
    Summary(oneshot::Sender<SessionSummary>),
    Leave,
    Shutdown,
}

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub state: ConnectionState,
    pub local_id: PeerId,
    pub room_code: RoomId,
    pub host_id: PeerId,
    pub role: Role,
    pub epoch: u64,
    pub peers: Vec<Peer>,
    pub linked: Vec<PeerId>,
    pub active_channel: ChannelId,
    pub channels: Vec<(ChannelId, String)>,
    pub bans: BanList,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        Self {
            state: session.state(),
            local_id: session.local_id().to_owned(),
            room_code: session.room_code().to_owned(),
            host_id: session.room_id().to_owned(),
            role: session.role(),
            epoch: session.epoch(),
            peers: session.peers(),
            linked: session.linked_peers(),
            active_channel: session.active_channel().to_owned(),
            channels: session
                .channels()
                .iter()
                .map(|channel| (channel.id.clone(), channel.name.clone()))
                .collect(),
            bans: session.bans().clone(),
        }
    }
}

#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    task: JoinHandle<Session>,
}

impl SessionHandle {
    /// Queues a command; returns `false` once the session task has exited.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Returns the first code tried; if that one was taken the code that
    /// finally opens arrives in [`SessionNotice::RoomReady`].
    pub async fn create_room(&self) -> Result<RoomId, SessionError> {
        let (reply, rx) = oneshot::channel();
        if !self.send(SessionCommand::CreateRoom { reply }) {
            return Err(SessionError::NotConnected);
        }
        rx.await.map_err(|_| SessionError::NotConnected)?
    }

    pub async fn summary(&self) -> Option<SessionSummary> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SessionCommand::Summary(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn next_notice(&mut self) -> Option<SessionNotice> {
        self.notices.recv().await
    }

    /// Waits for the first notice matching `predicate`, discarding the rest.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<SessionNotice>
    where
        F: FnMut(&SessionNotice) -> bool,
    {
        while let Some(notice) = self.notices.recv().await {
            if predicate(&notice) {
                return Some(notice);
            }
        }
        None
    }

    /// Leaves the room, stops the task and hands the session back.
    pub async fn shutdown(self) -> Option<Session> {
        let _ = self.commands.send(SessionCommand::Shutdown);
        self.task.await.ok()
    }
}

/// Spawns the driver task. `events_tx` must feed `events_rx`; it is used to
/// deliver fired timers back into the same queue as transport events.
pub fn spawn_session(
    mut session: Session,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionHandle {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => session.handle_event(event),
                    None => break,
                },
                command = command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(err) = run_command(&mut session, command) {
                            warn!(local_id = %session.local_id(), "command failed: {}", err);
                            let _ = notice_tx.send(SessionNotice::Error(err.to_string()));
                        }
                    }
                },
            }

            for scheduled in session.take_timers() {
                arm(scheduled, events_tx.clone());
            }
            for notice in session.take_notices() {
                let _ = notice_tx.send(notice);
            }
        }
        session.leave();
        debug!("session task stopped");
        session
    });

    SessionHandle {
        commands: command_tx,
        notices: notice_rx,
        task,
    }
}

fn arm(scheduled: ScheduledTimer, events: mpsc::UnboundedSender<SessionEvent>) {
    tokio::spawn(async move {
        tokio::time::sleep(scheduled.delay).await;
        let _ = events.send(SessionEvent::Timer(scheduled.timer));
    });
}

fn run_command(session: &mut Session, command: SessionCommand) -> Result<(), SessionError> {
    match command {
        SessionCommand::CreateRoom { reply } => {
            let _ = reply.send(session.create_room());
        }
        SessionCommand::JoinRoom { code, local_id } => match local_id {
            Some(local_id) => session.join_room_as(&code, &local_id)?,
            None => session.join_room(&code)?,
        },
        SessionCommand::SendChat(text) => {
            session.send_chat(&text)?;
        }
        SessionCommand::CreateChannel(name) => {
            session.create_channel(&name)?;
        }
        SessionCommand::DeleteChannel(channel_id) => session.delete_channel(&channel_id)?,
        SessionCommand::SwitchChannel(channel_id) => {
            session.switch_channel(&channel_id)?;
        }
        SessionCommand::SendFile { name, mime, data } => {
            session.send_file(&name, &mime, data)?;
        }
        SessionCommand::Promote(peer_id) => session.promote(&peer_id)?,
        SessionCommand::Demote(peer_id) => session.demote(&peer_id)?,
        SessionCommand::Kick(peer_id) => session.kick(&peer_id)?,
        SessionCommand::Ban(peer_id) => session.ban(&peer_id)?,
        SessionCommand::Unban(name) => session.unban(&name)?,
        SessionCommand::Timeout { peer_id, duration } => session.timeout(&peer_id, duration)?,
        SessionCommand::Summary(reply) => {
            let _ = reply.send(SessionSummary::of(session));
        }
        SessionCommand::Leave => session.leave(),
        SessionCommand::Shutdown => {}
    }
    Ok(())
}
