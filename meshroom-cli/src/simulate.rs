//! A whole room in one process: a host and `peers` members over
//! [`MemoryNetwork`], each driven by its own tokio task.

use std::time::Duration;

use bytes::Bytes;
use meshroom_core::{PeerId, RoomId};
use meshroom_session::{
    BanList, MemoryNetwork, SessionCommand, SessionConfig, SessionError, SessionHandle,
    SessionNotice,
};
use thiserror::Error;
use tokio::time::timeout;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub peers: usize,
    pub crash_host: bool,
    /// Have the host ban the first member after the chat round.
    pub ban_first: bool,
    pub file_size: Option<usize>,
    pub step_timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            peers: 3,
            crash_host: false,
            ban_first: false,
            file_size: None,
            step_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub room_code: RoomId,
    pub chats_delivered: usize,
    pub files_delivered: usize,
    pub final_host: PeerId,
    pub epoch: u64,
    pub peers_seen_by_host: usize,
    /// Ban list reported by the host, keyed by room code, when it changed.
    pub bans: Option<(RoomId, BanList)>,
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("session of {0} stopped unexpectedly")]
    Stopped(String),
}

pub fn member_id(index: usize) -> PeerId {
    format!("peer-{index:02}")
}

async fn expect(
    handle: &mut SessionHandle,
    who: &str,
    what: &str,
    step_timeout: Duration,
    predicate: impl FnMut(&SessionNotice) -> bool,
) -> Result<SessionNotice, SimulationError> {
    timeout(step_timeout, handle.wait_for(predicate))
        .await
        .map_err(|_| SimulationError::Timeout(format!("{what} on {who}")))?
        .ok_or_else(|| SimulationError::Stopped(who.to_owned()))
}

pub async fn run(
    options: &SimulationOptions,
    host_config: SessionConfig,
) -> Result<SimulationReport, SimulationError> {
    let network = MemoryNetwork::new();
    let step = options.step_timeout;

    let mut host = network.spawn_session(host_config);
    host.create_room().await?;
    let room_code = match expect(&mut host, "host", "room ready", step, |n| {
        matches!(n, SessionNotice::RoomReady { .. })
    })
    .await?
    {
        SessionNotice::RoomReady { room_code, .. } => room_code,
        _ => return Err(SimulationError::Stopped("host".to_owned())),
    };
    info!(room_code = %room_code, peers = options.peers, "simulated room created");

    let mut members = Vec::with_capacity(options.peers);
    for index in 0..options.peers {
        let id = member_id(index);
        let mut member = network.spawn_session(SessionConfig::new(format!("Peer {index}")));
        member.send(SessionCommand::JoinRoom {
            code: room_code.clone(),
            local_id: Some(id.clone()),
        });
        expect(&mut member, &id, "room ready", step, |n| {
            matches!(n, SessionNotice::RoomReady { .. })
        })
        .await?;
        info!(peer_id = %id, "member joined");
        members.push((id, member));
    }

    for (id, member) in &members {
        member.send(SessionCommand::SendChat(format!("hello from {id}")));
    }
    let mut chats_delivered = 0;
    for _ in 0..members.len() {
        expect(&mut host, "host", "chat", step, |n| {
            matches!(n, SessionNotice::Chat(_))
        })
        .await?;
        chats_delivered += 1;
    }
    info!(chats_delivered, "chat round complete");

    let mut files_delivered = 0;
    if let Some(size) = options.file_size.filter(|size| *size > 0) {
        let data: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        host.send(SessionCommand::SendFile {
            name: "simulated.bin".to_owned(),
            mime: "application/octet-stream".to_owned(),
            data: data.clone(),
        });
        for (id, member) in members.iter_mut() {
            let notice = expect(member, id, "file", step, |n| {
                matches!(n, SessionNotice::FileReceived(_))
            })
            .await?;
            if let SessionNotice::FileReceived(file) = notice
                && file.bytes == data
            {
                files_delivered += 1;
            }
        }
        info!(files_delivered, size, "file round complete");
    }

    let mut bans = None;
    if options.ban_first && !members.is_empty() {
        let (id, mut banned) = members.remove(0);
        host.send(SessionCommand::Ban(id.clone()));
        let notice = expect(&mut host, "host", "ban", step, |n| {
            matches!(n, SessionNotice::BansChanged { .. })
        })
        .await?;
        if let SessionNotice::BansChanged { room_code, bans: list } = notice {
            bans = Some((room_code, list));
        }
        expect(&mut banned, &id, "termination", step, |n| {
            matches!(n, SessionNotice::Terminated { .. })
        })
        .await?;
        info!(peer_id = %id, "member banned");
        let _ = banned.shutdown().await;
    }

    let host_summary = host
        .summary()
        .await
        .ok_or_else(|| SimulationError::Stopped("host".to_owned()))?;
    let peers_seen_by_host = host_summary.peers.len();

    let (final_host, epoch) = if options.crash_host && !members.is_empty() {
        let _ = host.shutdown().await;
        info!("host stopped; waiting for re-election");
        let mut winner = None;
        for (id, member) in members.iter_mut() {
            let notice = expect(member, id, "host change", step, |n| {
                matches!(n, SessionNotice::HostChanged { .. })
            })
            .await?;
            if let SessionNotice::HostChanged { host_id, epoch } = notice {
                winner = Some((host_id, epoch));
            }
        }
        winner.ok_or_else(|| SimulationError::Timeout("re-election".to_owned()))?
    } else {
        let _ = host.shutdown().await;
        (host_summary.host_id, host_summary.epoch)
    };
    info!(final_host = %final_host, epoch, "simulation finished");

    for (_, member) in members {
        let _ = member.shutdown().await;
    }

    Ok(SimulationReport {
        room_code,
        chats_delivered,
        files_delivered,
        final_host,
        epoch,
        peers_seen_by_host,
        bans,
    })
}
