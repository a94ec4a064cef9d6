//! Contract between the session engine and the peer-to-peer transport.
//!
//! The transport (a WebRTC data-channel library in a browser, or
//! [`crate::memory::MemoryNetwork`] in tests) owns the sockets. It reports
//! everything that happens as [`SessionEvent`]s which the session consumes
//! one at a time.

use std::{fmt, time::Duration};

use bytes::Bytes;
use meshroom_core::{FileId, PeerId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("link {0} is closed")]
    LinkClosed(LinkId),
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),
    #[error("identity is not open")]
    IdentityNotOpen,
    #[error("signaling unavailable: {0}")]
    Signaling(String),
}

/// A reliable, ordered, point-to-point data channel to one peer.
///
/// Payloads sent after `LinkOpen` and before `LinkClosed` arrive in order
/// and intact, or the link closes.
pub trait Link: Send + fmt::Debug {
    fn id(&self) -> LinkId;
    fn peer_id(&self) -> &str;
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;
    fn close(&self);
}

pub trait Transport: Send {
    /// Registers `identity` with the signaling layer. Completion arrives as
    /// [`SessionEvent::IdentityOpen`] or [`SessionEvent::IdentityUnavailable`].
    fn open_identity(&mut self, identity: &str) -> Result<(), TransportError>;

    /// Re-registers the last identity after a signaling disconnect.
    fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Starts dialing `peer_id`. The returned link is usable once
    /// [`SessionEvent::LinkOpen`] arrives for it.
    fn connect(&mut self, peer_id: &str) -> Result<Box<dyn Link>, TransportError>;

    /// Releases the identity. Links are closed separately by the session.
    fn shutdown(&mut self);
}

#[derive(Debug)]
pub enum SessionEvent {
    IdentityOpen {
        identity: String,
    },
    IdentityUnavailable {
        identity: String,
        reason: String,
    },
    SignalingDisconnected,
    /// A remote peer dialed us.
    Incoming {
        link: Box<dyn Link>,
    },
    LinkOpen {
        link_id: LinkId,
        peer_id: PeerId,
    },
    LinkData {
        link_id: LinkId,
        peer_id: PeerId,
        payload: Bytes,
    },
    LinkClosed {
        link_id: LinkId,
        peer_id: PeerId,
    },
    LinkError {
        link_id: LinkId,
        peer_id: PeerId,
        reason: String,
    },
    Timer(Timer),
}

/// Deferred work. Every timer is re-validated against current state when it
/// fires and silently skipped if its guard no longer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    ConnectTimeout { peer_id: PeerId, link_id: LinkId },
    HistorySync { peer_id: PeerId, link_id: LinkId },
    SignalingReconnect { attempt: u32 },
    MuteExpired { peer_id: PeerId, until_ms: u64 },
    TransferIdle { file_id: FileId, activity: u64 },
    SendNextChunk { file_id: FileId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub delay: Duration,
    pub timer: Timer,
}
