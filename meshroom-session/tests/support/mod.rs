#![allow(dead_code)]

use std::collections::BTreeMap;

use bytes::Bytes;
use meshroom_core::{ChatMessage, WireMessage, encode_message};
use meshroom_session::{
    MemoryNetwork, ScheduledTimer, Session, SessionConfig, SessionEvent, SessionNotice, Timer,
};
use tokio::sync::mpsc;

pub struct Node {
    pub session: Session,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    pub notices: Vec<SessionNotice>,
    pub timers: Vec<ScheduledTimer>,
}

impl Node {
    /// Moves everything the session produced into this node's buffers.
    pub fn collect(&mut self) {
        self.notices.extend(self.session.take_notices());
        self.timers.extend(self.session.take_timers());
    }

    pub fn chats(&self) -> Vec<&ChatMessage> {
        self.notices
            .iter()
            .filter_map(|notice| match notice {
                SessionNotice::Chat(chat) => Some(chat),
                _ => None,
            })
            .collect()
    }

    pub fn chat_texts(&self) -> Vec<&str> {
        self.chats().iter().map(|chat| chat.text.as_str()).collect()
    }

    pub fn has_notice(&self, predicate: impl Fn(&SessionNotice) -> bool) -> bool {
        self.notices.iter().any(predicate)
    }

    pub fn clear(&mut self) {
        self.notices.clear();
    }

    /// Feeds a message to the session as if `from` had sent it.
    pub fn inject(&mut self, message: WireMessage, from: &str) {
        let raw: Bytes = encode_message(&message).expect("encode");
        self.session.route(message, &raw, from);
        self.collect();
    }
}

/// Several sessions over one [`MemoryNetwork`], pumped synchronously.
///
/// Transport events are delivered round-robin until every queue is empty.
/// Timers are never fired implicitly; tests fire them with [`Room::fire`].
pub struct Room {
    pub network: MemoryNetwork,
    nodes: BTreeMap<String, Node>,
}

impl Room {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, label: &str, display_name: &str) -> &mut Node {
        self.add_with(label, SessionConfig::new(display_name))
    }

    pub fn add_with(&mut self, label: &str, config: SessionConfig) -> &mut Node {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.network.endpoint(tx);
        self.nodes.insert(
            label.to_owned(),
            Node {
                session: Session::new(config, Box::new(transport)),
                events: rx,
                notices: Vec::new(),
                timers: Vec::new(),
            },
        );
        self.node(label)
    }

    pub fn node(&mut self, label: &str) -> &mut Node {
        self.nodes
            .get_mut(label)
            .unwrap_or_else(|| panic!("no node {label}"))
    }

    pub fn session(&self, label: &str) -> &Session {
        &self.nodes[label].session
    }

    pub fn labels(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Creates a room on `label` and returns its code.
    pub fn host(&mut self, label: &str, display_name: &str) -> String {
        self.add(label, display_name);
        let code = self
            .node(label)
            .session
            .create_room()
            .expect("create room");
        self.pump();
        code
    }

    /// Adds a member with local id `label` to the room `code`.
    pub fn join(&mut self, label: &str, display_name: &str, code: &str) {
        self.add(label, display_name);
        self.node(label)
            .session
            .join_room_as(code, label)
            .expect("join room");
        self.pump();
    }

    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for node in self.nodes.values_mut() {
                node.collect();
                while let Ok(event) = node.events.try_recv() {
                    node.session.handle_event(event);
                    node.collect();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Fires every pending timer on every node that matches `predicate`,
    /// pumping after each one, until none remain. Returns how many fired.
    pub fn fire(&mut self, predicate: impl Fn(&Timer) -> bool) -> usize {
        let mut fired = 0;
        loop {
            let mut due = Vec::new();
            for (label, node) in self.nodes.iter_mut() {
                let (matching, rest): (Vec<_>, Vec<_>) = node
                    .timers
                    .drain(..)
                    .partition(|scheduled| predicate(&scheduled.timer));
                node.timers = rest;
                due.extend(matching.into_iter().map(|s| (label.clone(), s.timer)));
            }
            if due.is_empty() {
                return fired;
            }
            for (label, timer) in due {
                if let Some(node) = self.nodes.get_mut(&label) {
                    node.session.handle_event(SessionEvent::Timer(timer));
                    node.collect();
                    fired += 1;
                }
                self.pump();
            }
        }
    }

    /// Fires the first pending timer on `label` that matches `predicate`.
    pub fn fire_next(&mut self, label: &str, predicate: impl Fn(&Timer) -> bool) -> bool {
        let node = self.node(label);
        let Some(position) = node.timers.iter().position(|s| predicate(&s.timer)) else {
            return false;
        };
        let scheduled = node.timers.remove(position);
        node.session.handle_event(SessionEvent::Timer(scheduled.timer));
        node.collect();
        self.pump();
        true
    }

    pub fn fire_history_sync(&mut self) -> usize {
        self.fire(|timer| matches!(timer, Timer::HistorySync { .. }))
    }

    /// Fires chunk timers until every outgoing transfer has finished.
    pub fn stream_files(&mut self) -> usize {
        self.fire(|timer| matches!(timer, Timer::SendNextChunk { .. }))
    }

    /// Simulates `label` vanishing without a goodbye.
    pub fn crash(&mut self, label: &str) -> Node {
        let node = self
            .nodes
            .remove(label)
            .unwrap_or_else(|| panic!("no node {label}"));
        self.network.drop_endpoint(node.session.local_id());
        self.pump();
        node
    }

    pub fn clear_notices(&mut self) {
        for node in self.nodes.values_mut() {
            node.clear();
        }
    }
}

/// A host `h` with members `a`, `b` and `c`, fully meshed and history-synced.
pub fn full_room() -> (Room, String) {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);
    room.join("b", "Ben", &code);
    room.join("c", "Cid", &code);
    room.fire_history_sync();
    room.clear_notices();
    (room, code)
}
