//! Serverless room session engine.
//!
//! A [`Session`] is one participant's view of a room: it hosts or joins,
//! relays traffic when hosting, keeps a mesh of direct links to the other
//! members so a new host can be elected when the current one vanishes, and
//! carries chat, channels, moderation and chunked file transfer on top.
//!
//! The engine is synchronous and transport-agnostic. Links and identity
//! registration live behind [`Transport`]; [`memory::MemoryNetwork`] is a
//! process-local implementation and [`runtime::spawn_session`] drives a
//! session on tokio.

pub mod channels;
pub mod config;
mod connection;
pub mod error;
pub mod memory;
pub mod registry;
mod router;
pub mod runtime;
mod session;
pub mod transfer;
pub mod transport;

pub use channels::{Channel, ChannelStore};
pub use config::{BanList, SessionConfig};
pub use error::SessionError;
pub use memory::{MemoryLink, MemoryNetwork, MemoryTransport};
pub use registry::Peer;
pub use runtime::{SessionCommand, SessionHandle, SessionSummary, spawn_session};
pub use session::{ConnectionState, Session, SessionNotice};
pub use transfer::{FileTransferEngine, ReceivedFile, TransferError};
pub use transport::{Link, LinkId, ScheduledTimer, SessionEvent, Timer, Transport, TransportError};
