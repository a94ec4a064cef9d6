//! Membership, links and moderation state of the current room.

use std::collections::HashMap;

use bytes::Bytes;
use meshroom_core::{PeerId, Role, UserInfo};
use tracing::{debug, warn};

use crate::{
    config::BanList,
    transport::{Link, LinkId, TransportError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub avatar: Option<String>,
    pub role: Role,
}

impl Peer {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            peer_id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            role: self.role,
        }
    }
}

impl From<&UserInfo> for Peer {
    fn from(info: &UserInfo) -> Self {
        Self {
            id: info.peer_id.clone(),
            name: info.name.clone(),
            avatar: info.avatar.clone(),
            role: info.role,
        }
    }
}

#[derive(Debug)]
struct LinkSlot {
    link: Box<dyn Link>,
    open: bool,
    /// Peer id of whoever dialed this link.
    initiator: PeerId,
}

/// Result of handing a new link to the registry. Any link returned here is
/// no longer tracked and must be closed by the caller.
#[derive(Debug)]
pub enum Attach {
    Attached,
    Replaced(Box<dyn Link>),
    Rejected(Box<dyn Link>),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: HashMap<PeerId, Peer>,
    links: HashMap<PeerId, LinkSlot>,
    bans: BanList,
    muted: HashMap<PeerId, u64>,
}

impl SessionRegistry {
    pub fn new(bans: BanList) -> Self {
        Self {
            bans,
            ..Self::default()
        }
    }

    /// Inserts or refreshes a peer. Returns `true` the first time the id is seen.
    pub fn upsert_peer(&mut self, info: &UserInfo) -> bool {
        match self.peers.get_mut(&info.peer_id) {
            Some(existing) => {
                existing.name = info.name.clone();
                existing.avatar = info.avatar.clone();
                existing.role = info.role;
                false
            }
            None => {
                self.peers.insert(info.peer_id.clone(), Peer::from(info));
                true
            }
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn role_of(&self, peer_id: &str) -> Option<Role> {
        self.peers.get(peer_id).map(|peer| peer.role)
    }

    pub fn set_role(&mut self, peer_id: &str, role: Role) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.role = role;
                true
            }
            None => false,
        }
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Peer> {
        self.muted.remove(peer_id);
        self.peers.remove(peer_id)
    }

    pub fn attach_link(&mut self, link: Box<dyn Link>, initiator: &str) -> Attach {
        let peer_id = link.peer_id().to_owned();
        let Some(existing) = self.links.get(&peer_id) else {
            self.links.insert(
                peer_id,
                LinkSlot {
                    link,
                    open: false,
                    initiator: initiator.to_owned(),
                },
            );
            return Attach::Attached;
        };

        // Simultaneous dials between two peers: the link dialed by the
        // smaller id wins on both sides, open or not. A redial from the same
        // side only replaces a link that never opened.
        let keep_existing = if existing.initiator == initiator {
            existing.open
        } else {
            existing.initiator.as_str() < initiator
        };
        if keep_existing {
            debug!(peer_id = %peer_id, link = %link.id(), "rejecting duplicate link");
            return Attach::Rejected(link);
        }

        let replaced = self.links.insert(
            peer_id.clone(),
            LinkSlot {
                link,
                open: false,
                initiator: initiator.to_owned(),
            },
        );
        match replaced {
            Some(slot) => {
                debug!(peer_id = %peer_id, link = %slot.link.id(), "replacing pending link");
                Attach::Replaced(slot.link)
            }
            None => Attach::Attached,
        }
    }

    pub fn mark_open(&mut self, peer_id: &str, link_id: LinkId) -> bool {
        match self.links.get_mut(peer_id) {
            Some(slot) if slot.link.id() == link_id => {
                slot.open = true;
                true
            }
            _ => false,
        }
    }

    pub fn link_matches(&self, peer_id: &str, link_id: LinkId) -> bool {
        self.links
            .get(peer_id)
            .is_some_and(|slot| slot.link.id() == link_id)
    }

    pub fn has_link(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.links.get(peer_id).is_some_and(|slot| slot.open)
    }

    pub fn open_peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, slot)| slot.open)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Removes the link for `peer_id` only if it is the one identified by `link_id`.
    pub fn detach_link(&mut self, peer_id: &str, link_id: LinkId) -> Option<Box<dyn Link>> {
        if !self.link_matches(peer_id, link_id) {
            return None;
        }
        self.links.remove(peer_id).map(|slot| slot.link)
    }

    pub fn take_link(&mut self, peer_id: &str) -> Option<Box<dyn Link>> {
        self.links.remove(peer_id).map(|slot| slot.link)
    }

    pub fn send_to(&self, peer_id: &str, payload: Bytes) -> Result<(), TransportError> {
        match self.links.get(peer_id) {
            Some(slot) if slot.open => slot.link.send(payload),
            Some(slot) => Err(TransportError::LinkClosed(slot.link.id())),
            None => Err(TransportError::PeerUnavailable(peer_id.to_owned())),
        }
    }

    /// Sends to every open link except `except`; returns the number of sends
    /// that were accepted.
    pub fn send_all_except(&self, except: Option<&str>, payload: &Bytes) -> usize {
        let mut sent = 0;
        for (peer_id, slot) in &self.links {
            if !slot.open || Some(peer_id.as_str()) == except {
                continue;
            }
            match slot.link.send(payload.clone()) {
                Ok(()) => sent += 1,
                Err(err) => warn!(peer_id = %peer_id, "send failed: {}", err),
            }
        }
        sent
    }

    pub fn close_all(&mut self) {
        for (_, slot) in self.links.drain() {
            slot.link.close();
        }
    }

    /// Closes every link and forgets all peers; the ban list is replaced.
    pub fn reset(&mut self, bans: BanList) {
        self.close_all();
        self.peers.clear();
        self.muted.clear();
        self.bans = bans;
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.bans.contains_key(name)
    }

    pub fn ban(&mut self, name: &str, at_ms: u64) -> bool {
        self.bans.insert(name.to_owned(), at_ms).is_none()
    }

    pub fn unban(&mut self, name: &str) -> bool {
        self.bans.remove(name).is_some()
    }

    pub fn mute(&mut self, peer_id: &str, until_ms: u64) {
        self.muted.insert(peer_id.to_owned(), until_ms);
    }

    pub fn muted_until(&self, peer_id: &str) -> Option<u64> {
        self.muted.get(peer_id).copied()
    }

    /// Lifts a mute only if it is still the one that expires at `until_ms`.
    pub fn unmute_if(&mut self, peer_id: &str, until_ms: u64) -> bool {
        if self.muted.get(peer_id) == Some(&until_ms) {
            self.muted.remove(peer_id);
            return true;
        }
        false
    }
}
