//! Process-local transport. Every endpoint is a `SessionEvent` queue; links
//! are pairs of queues that deliver in order and report closure to both ends.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    config::SessionConfig,
    runtime::{SessionHandle, spawn_session},
    session::Session,
    transport::{Link, LinkId, SessionEvent, Transport, TransportError},
};

type EventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug)]
struct LinkEnds {
    ids: [String; 2],
    senders: [EventSender; 2],
    closed: bool,
}

#[derive(Debug)]
struct Hub {
    identities: HashMap<String, EventSender>,
    links: HashMap<LinkId, LinkEnds>,
    next_link: u64,
    signaling_available: bool,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            identities: HashMap::new(),
            links: HashMap::new(),
            next_link: 0,
            signaling_available: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport whose events are delivered to `events`.
    pub fn endpoint(&self, events: EventSender) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            events,
            identity: None,
        }
    }

    /// Builds a session on a fresh endpoint and drives it on the tokio runtime.
    pub fn spawn_session(&self, config: SessionConfig) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.endpoint(events_tx.clone());
        spawn_session(Session::new(config, Box::new(transport)), events_tx, events_rx)
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.hub().identities.contains_key(identity)
    }

    pub fn open_link_count(&self) -> usize {
        self.hub().links.values().filter(|l| !l.closed).count()
    }

    /// Simulates a crash: the identity vanishes and every link it holds
    /// closes on the far side only.
    pub fn drop_endpoint(&self, identity: &str) {
        let mut hub = self.hub();
        hub.identities.remove(identity);
        for (link_id, ends) in hub.links.iter_mut() {
            if ends.closed {
                continue;
            }
            let Some(side) = ends.ids.iter().position(|id| id == identity) else {
                continue;
            };
            ends.closed = true;
            let other = 1 - side;
            let _ = ends.senders[other].send(SessionEvent::LinkClosed {
                link_id: *link_id,
                peer_id: ends.ids[side].clone(),
            });
        }
        debug!(identity = %identity, "endpoint dropped");
    }

    /// Drops the signaling registration of `identity` without touching its links.
    pub fn disconnect_signaling(&self, identity: &str) {
        let mut hub = self.hub();
        if let Some(sender) = hub.identities.remove(identity) {
            let _ = sender.send(SessionEvent::SignalingDisconnected);
        }
    }

    pub fn set_signaling_available(&self, available: bool) {
        self.hub().signaling_available = available;
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    events: EventSender,
    identity: Option<String>,
}

impl MemoryTransport {
    fn register(&mut self, identity: &str) -> Result<(), TransportError> {
        let mut hub = self.network.hub();
        if !hub.signaling_available {
            return Err(TransportError::Signaling("signaling server unreachable".to_owned()));
        }
        if let Some(existing) = hub.identities.get(identity)
            && !existing.same_channel(&self.events)
        {
            let _ = self.events.send(SessionEvent::IdentityUnavailable {
                identity: identity.to_owned(),
                reason: "identity is taken".to_owned(),
            });
            return Ok(());
        }
        hub.identities
            .insert(identity.to_owned(), self.events.clone());
        let _ = self.events.send(SessionEvent::IdentityOpen {
            identity: identity.to_owned(),
        });
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn open_identity(&mut self, identity: &str) -> Result<(), TransportError> {
        self.shutdown();
        self.identity = Some(identity.to_owned());
        self.register(identity)
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        let identity = self
            .identity
            .clone()
            .ok_or(TransportError::IdentityNotOpen)?;
        self.register(&identity)
    }

    fn connect(&mut self, peer_id: &str) -> Result<Box<dyn Link>, TransportError> {
        let local_id = self
            .identity
            .clone()
            .ok_or(TransportError::IdentityNotOpen)?;
        let mut hub = self.network.hub();
        hub.next_link += 1;
        let link_id = LinkId(hub.next_link);

        let local = MemoryLink {
            id: link_id,
            side: 0,
            peer_id: peer_id.to_owned(),
            network: self.network.clone(),
        };

        let Some(remote_events) = hub.identities.get(peer_id).cloned() else {
            let _ = self.events.send(SessionEvent::LinkError {
                link_id,
                peer_id: peer_id.to_owned(),
                reason: format!("peer {peer_id} is unavailable"),
            });
            return Ok(Box::new(local));
        };

        hub.links.insert(
            link_id,
            LinkEnds {
                ids: [local_id.clone(), peer_id.to_owned()],
                senders: [self.events.clone(), remote_events.clone()],
                closed: false,
            },
        );
        let remote = MemoryLink {
            id: link_id,
            side: 1,
            peer_id: local_id.clone(),
            network: self.network.clone(),
        };
        let _ = remote_events.send(SessionEvent::Incoming {
            link: Box::new(remote),
        });
        let _ = remote_events.send(SessionEvent::LinkOpen {
            link_id,
            peer_id: local_id,
        });
        let _ = self.events.send(SessionEvent::LinkOpen {
            link_id,
            peer_id: peer_id.to_owned(),
        });
        Ok(Box::new(local))
    }

    fn shutdown(&mut self) {
        let Some(identity) = self.identity.take() else {
            return;
        };
        let mut hub = self.network.hub();
        if hub
            .identities
            .get(&identity)
            .is_some_and(|sender| sender.same_channel(&self.events))
        {
            hub.identities.remove(&identity);
        }
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    id: LinkId,
    side: usize,
    peer_id: String,
    network: MemoryNetwork,
}

impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let hub = self.network.hub();
        let ends = hub
            .links
            .get(&self.id)
            .filter(|ends| !ends.closed)
            .ok_or(TransportError::LinkClosed(self.id))?;
        let other = 1 - self.side;
        ends.senders[other]
            .send(SessionEvent::LinkData {
                link_id: self.id,
                peer_id: ends.ids[self.side].clone(),
                payload,
            })
            .map_err(|_| TransportError::LinkClosed(self.id))
    }

    fn close(&self) {
        let mut hub = self.network.hub();
        let Some(ends) = hub.links.get_mut(&self.id) else {
            return;
        };
        if ends.closed {
            return;
        }
        ends.closed = true;
        for side in 0..2 {
            let _ = ends.senders[side].send(SessionEvent::LinkClosed {
                link_id: self.id,
                peer_id: ends.ids[1 - side].clone(),
            });
        }
    }
}
