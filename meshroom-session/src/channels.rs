//! Named partitions of chat history.

use meshroom_core::{
    ChannelId, ChannelSnapshot, ChatMessage, DEFAULT_CHANNEL_ID, DEFAULT_CHANNEL_NAME,
    HistorySnapshot, MAX_CHANNEL_NAME_LEN, MAX_HISTORY_MESSAGES, generate_channel_id,
};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub messages: Vec<ChatMessage>,
}

impl Channel {
    fn new(id: ChannelId, name: String) -> Self {
        Self {
            id,
            name,
            messages: Vec::new(),
        }
    }
}

/// Channels in creation order plus the active one. The `default` channel
/// is always present.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    channels: Vec<Channel>,
    active: ChannelId,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self {
            channels: vec![Channel::new(
                DEFAULT_CHANNEL_ID.to_owned(),
                DEFAULT_CHANNEL_NAME.to_owned(),
            )],
            active: DEFAULT_CHANNEL_ID.to_owned(),
        }
    }

    pub fn active(&self) -> &str {
        &self.active
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn history(&self, id: &str) -> &[ChatMessage] {
        self.get(id).map(|c| c.messages.as_slice()).unwrap_or(&[])
    }

    /// Validates `name` and allocates a fresh channel. Does not switch.
    pub fn create(&mut self, name: &str) -> Result<&Channel, SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyChannelName);
        }
        if name.chars().count() > MAX_CHANNEL_NAME_LEN {
            return Err(SessionError::ChannelNameTooLong);
        }
        if self.name_taken(name) {
            return Err(SessionError::DuplicateChannel(name.to_owned()));
        }

        let mut id = generate_channel_id();
        while self.contains(&id) {
            id = generate_channel_id();
        }
        let index = self.channels.len();
        self.channels.push(Channel::new(id, name.to_owned()));
        Ok(&self.channels[index])
    }

    /// Adds a channel announced by another peer. Returns `false` when the id
    /// is already known.
    pub fn insert_remote(&mut self, id: &str, name: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.channels
            .push(Channel::new(id.to_owned(), name.trim().to_owned()));
        true
    }

    /// Removes a channel; switches to `default` first if it was active.
    pub fn remove(&mut self, id: &str) -> Result<Channel, SessionError> {
        if id == DEFAULT_CHANNEL_ID {
            return Err(SessionError::DefaultChannelUndeletable);
        }
        let position = self
            .channels
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| SessionError::UnknownChannel(id.to_owned()))?;
        if self.active == id {
            self.active = DEFAULT_CHANNEL_ID.to_owned();
        }
        Ok(self.channels.remove(position))
    }

    /// Returns `Ok(true)` if the active channel changed.
    pub fn switch(&mut self, id: &str) -> Result<bool, SessionError> {
        if !self.contains(id) {
            return Err(SessionError::UnknownChannel(id.to_owned()));
        }
        if self.active == id {
            return Ok(false);
        }
        self.active = id.to_owned();
        Ok(true)
    }

    /// Appends to the message's channel, or to `default` if that channel is
    /// unknown. Returns the channel the message landed in.
    pub fn append(&mut self, mut message: ChatMessage) -> ChannelId {
        if !self.contains(&message.channel) {
            message.channel = DEFAULT_CHANNEL_ID.to_owned();
        }
        let channel_id = message.channel.clone();
        if let Some(channel) = self.channels.iter_mut().find(|c| c.id == channel_id) {
            channel.messages.push(message);
        }
        channel_id
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            channels: self
                .channels
                .iter()
                .map(|c| {
                    let skip = c.messages.len().saturating_sub(MAX_HISTORY_MESSAGES);
                    ChannelSnapshot {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        messages: c.messages[skip..].to_vec(),
                    }
                })
                .collect(),
        }
    }

    /// Replaces histories with the host's snapshot, creating channels that are
    /// not known locally. Channels missing from the snapshot are left alone.
    pub fn load_snapshot(&mut self, snapshot: HistorySnapshot) {
        for incoming in snapshot.channels {
            match self.channels.iter_mut().find(|c| c.id == incoming.id) {
                Some(channel) => channel.messages = incoming.messages,
                None => self.channels.push(Channel {
                    id: incoming.id,
                    name: incoming.name,
                    messages: incoming.messages,
                }),
            }
        }
    }

    /// Case-insensitive; the built-in `default` channel's name is not reserved.
    fn name_taken(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        self.channels
            .iter()
            .any(|c| c.id != DEFAULT_CHANNEL_ID && c.name.to_lowercase() == wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(channel: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: text.to_owned(),
            author_id: "p".to_owned(),
            author: "P".to_owned(),
            text: text.to_owned(),
            timestamp: 1,
            channel: channel.to_owned(),
        }
    }

    #[test]
    fn default_channel_cannot_be_deleted() {
        let mut store = ChannelStore::new();
        assert!(matches!(
            store.remove(DEFAULT_CHANNEL_ID),
            Err(SessionError::DefaultChannelUndeletable)
        ));
        assert!(store.contains(DEFAULT_CHANNEL_ID));
    }

    #[test]
    fn duplicate_names_are_case_insensitive() {
        let mut store = ChannelStore::new();
        store.create("General").unwrap();
        assert!(matches!(
            store.create("general"),
            Err(SessionError::DuplicateChannel(_))
        ));
        assert_eq!(store.channels().len(), 2);
    }

    #[test]
    fn created_channel_is_returned_and_listed_last() {
        let mut store = ChannelStore::new();
        let created = store.create("  random ").unwrap().clone();
        assert_eq!(created.name, "random");
        assert!(created.messages.is_empty());
        assert_eq!(store.channels().last(), Some(&created));
    }

    #[test]
    fn blank_names_are_rejected() {
        let mut store = ChannelStore::new();
        assert!(matches!(store.create("   "), Err(SessionError::EmptyChannelName)));
        let long = "x".repeat(MAX_CHANNEL_NAME_LEN + 1);
        assert!(matches!(
            store.create(&long),
            Err(SessionError::ChannelNameTooLong)
        ));
        assert_eq!(store.channels().len(), 1);
    }

    #[test]
    fn removing_active_channel_falls_back_to_default() {
        let mut store = ChannelStore::new();
        let id = store.create("random").unwrap().id.clone();
        assert!(store.switch(&id).unwrap());
        store.remove(&id).unwrap();
        assert_eq!(store.active(), DEFAULT_CHANNEL_ID);
    }

    #[test]
    fn switch_is_noop_for_active_and_error_for_unknown() {
        let mut store = ChannelStore::new();
        assert!(!store.switch(DEFAULT_CHANNEL_ID).unwrap());
        assert!(matches!(
            store.switch("nope"),
            Err(SessionError::UnknownChannel(_))
        ));
        assert_eq!(store.active(), DEFAULT_CHANNEL_ID);
    }

    #[test]
    fn messages_for_unknown_channels_land_in_default() {
        let mut store = ChannelStore::new();
        assert_eq!(store.append(chat("ghost", "boo")), DEFAULT_CHANNEL_ID);
        assert_eq!(store.history(DEFAULT_CHANNEL_ID).len(), 1);
    }

    #[test]
    fn snapshot_loads_into_fresh_store() {
        let mut host = ChannelStore::new();
        let id = host.create("dev").unwrap().id.clone();
        host.append(chat(DEFAULT_CHANNEL_ID, "one"));
        host.append(chat(&id, "two"));

        let mut member = ChannelStore::new();
        member.load_snapshot(host.snapshot());
        assert_eq!(member.history(DEFAULT_CHANNEL_ID)[0].text, "one");
        assert_eq!(member.history(&id)[0].text, "two");
        assert_eq!(member.get(&id).unwrap().name, "dev");
    }

    #[test]
    fn snapshot_is_bounded_per_channel() {
        let mut store = ChannelStore::new();
        for i in 0..MAX_HISTORY_MESSAGES + 5 {
            store.append(chat(DEFAULT_CHANNEL_ID, &i.to_string()));
        }
        let snapshot = store.snapshot();
        let messages = &snapshot.channels[0].messages;
        assert_eq!(messages.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(messages[0].text, "5");
    }
}
