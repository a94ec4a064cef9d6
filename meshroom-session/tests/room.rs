mod support;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use meshroom_core::{
    ChatMessage, DEFAULT_CHANNEL_ID, Role, WireMessage, decode_message, now_unix_ms,
};
use meshroom_session::{
    ConnectionState, Link, MemoryNetwork, Session, SessionConfig, SessionError, SessionEvent,
    SessionNotice, Timer, Transport, TransportError,
};
use support::{Room, full_room};

#[derive(Debug, Default)]
struct SilentTransport;

#[derive(Debug)]
struct SilentLink {
    peer_id: String,
}

impl Link for SilentLink {
    fn id(&self) -> meshroom_session::LinkId {
        meshroom_session::LinkId(1)
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, _payload: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Accepts every request and never reports back, so links never open.
impl Transport for SilentTransport {
    fn open_identity(&mut self, _identity: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&mut self, peer_id: &str) -> Result<Box<dyn Link>, TransportError> {
        Ok(Box::new(SilentLink {
            peer_id: peer_id.to_owned(),
        }))
    }

    fn shutdown(&mut self) {}
}

/// Reports the first `taken` identities as already registered, then opens
/// the rest. Records every identity it was asked for.
#[derive(Debug)]
struct CrowdedTransport {
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    taken: usize,
    requested: Arc<Mutex<Vec<String>>>,
}

impl Transport for CrowdedTransport {
    fn open_identity(&mut self, identity: &str) -> Result<(), TransportError> {
        let mut requested = self.requested.lock().unwrap();
        requested.push(identity.to_owned());
        let event = if requested.len() <= self.taken {
            SessionEvent::IdentityUnavailable {
                identity: identity.to_owned(),
                reason: "identity already registered".to_owned(),
            }
        } else {
            SessionEvent::IdentityOpen {
                identity: identity.to_owned(),
            }
        };
        let _ = self.events.send(event);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&mut self, peer_id: &str) -> Result<Box<dyn Link>, TransportError> {
        Err(TransportError::PeerUnavailable(peer_id.to_owned()))
    }

    fn shutdown(&mut self) {}
}

fn crowded_host(taken: usize) -> (Session, Vec<SessionNotice>, Arc<Mutex<Vec<String>>>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let requested = Arc::new(Mutex::new(Vec::new()));
    let transport = CrowdedTransport {
        events: tx,
        taken,
        requested: Arc::clone(&requested),
    };
    let mut session = Session::new(SessionConfig::new("Hana"), Box::new(transport));
    session.create_room().unwrap();
    while let Ok(event) = rx.try_recv() {
        session.handle_event(event);
    }
    let notices = session.take_notices();
    (session, notices, requested)
}

#[test]
fn taken_room_code_is_replaced_with_a_fresh_one() {
    let (session, notices, requested) = crowded_host(2);
    let requested = requested.lock().unwrap().clone();
    assert_eq!(requested.len(), 3);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.room_code(), requested[2]);
    assert_eq!(session.local_id(), requested[2]);
    assert!(notices.iter().any(|n| matches!(
        n,
        SessionNotice::RoomReady { room_code, role: Role::Host, .. } if *room_code == requested[2]
    )));
    assert!(!notices.iter().any(|n| matches!(n, SessionNotice::Terminated { .. })));
}

#[test]
fn room_code_retries_are_capped() {
    let max = SessionConfig::default().max_room_code_attempts as usize;
    let (session, notices, requested) = crowded_host(usize::MAX);
    assert_eq!(requested.lock().unwrap().len(), max);
    assert_eq!(session.state(), ConnectionState::Terminated);
    assert!(notices.iter().any(|n| matches!(n, SessionNotice::Terminated { .. })));
}

#[test]
fn member_identity_collision_is_not_retried() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);
    room.add("a2", "Ann");
    room.node("a2").session.join_room_as(&code, "a").unwrap();
    room.pump();
    assert_eq!(room.session("a2").state(), ConnectionState::Terminated);
    assert_eq!(room.session("a").state(), ConnectionState::Connected);
}

#[test]
fn invalid_room_code_is_rejected_before_any_transport_activity() {
    let network = MemoryNetwork::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = Session::new(SessionConfig::new("Ann"), Box::new(network.endpoint(tx)));

    for code in ["", "abc", "abcde", "ab-d", "ab d", " abcd", "abcd\t", "  AB12 "] {
        let err = session.join_room(code).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoomCode(_)), "{code:?}");
    }
    assert_eq!(session.state(), ConnectionState::Idle);
    assert!(rx.try_recv().is_err());
    assert_eq!(network.open_link_count(), 0);
}

#[test]
fn padded_code_for_a_live_room_opens_no_link() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.add("a", "Ann");
    for padded in [format!(" {code}\t"), format!("{code} "), format!("\n{code}")] {
        let err = room.node("a").session.join_room_as(&padded, "a").unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoomCode(_)), "{padded:?}");
    }
    room.pump();
    assert_eq!(room.session("a").state(), ConnectionState::Idle);
    assert!(room.session("a").linked_peers().is_empty());
    assert!(room.session("h").peers().is_empty());
    assert_eq!(room.network.open_link_count(), 0);
}

#[test]
fn room_codes_are_case_insensitive() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code.to_uppercase());
    assert_eq!(room.session("a").state(), ConnectionState::Connected);
    assert_eq!(room.session("a").room_code(), code);
}

#[test]
fn host_and_member_reach_connected_and_see_each_other() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    assert_eq!(room.session("h").state(), ConnectionState::Connected);
    assert!(room.node("h").has_notice(|n| matches!(
        n,
        SessionNotice::RoomReady { role: Role::Host, .. }
    )));

    room.join("a", "Ann", &code);
    let member = room.session("a");
    assert_eq!(member.state(), ConnectionState::Connected);
    assert_eq!(member.room_id(), code);
    assert_eq!(member.peer(&code).map(|p| p.role), Some(Role::Host));
    assert_eq!(member.peer(&code).map(|p| p.name.as_str()), Some("Hana"));
    assert_eq!(room.session("h").peer("a").map(|p| p.name.as_str()), Some("Ann"));
}

#[test]
fn joining_a_room_nobody_hosts_terminates() {
    let mut room = Room::new();
    room.join("a", "Ann", "zzzz");
    let node = room.node("a");
    assert_eq!(node.session.state(), ConnectionState::Terminated);
    assert!(node.has_notice(|n| matches!(n, SessionNotice::Error(_))));
    assert!(node.has_notice(|n| matches!(n, SessionNotice::Terminated { .. })));
}

#[test]
fn every_member_is_linked_to_every_other() {
    let (room, code) = full_room();
    assert_eq!(
        room.session("h").linked_peers(),
        vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]
    );
    let mut expected = vec![code.clone(), "b".to_owned(), "c".to_owned()];
    expected.sort();
    assert_eq!(room.session("a").linked_peers(), expected);
    for label in ["a", "b", "c"] {
        assert_eq!(room.session(label).peers().len(), 3, "{label} knows everyone");
    }
}

#[test]
fn relay_delivers_exactly_one_copy_and_never_echoes() {
    let (mut room, _code) = full_room();
    let sent = room.node("a").session.send_chat("hello all").unwrap();
    room.pump();

    for label in ["h", "b", "c"] {
        let texts = room.node(label).chat_texts();
        assert_eq!(texts, vec!["hello all"], "{label}");
    }
    // The sender only sees its own local notice.
    let own = room.node("a").chats().len();
    assert_eq!(own, 1);
    assert_eq!(room.session("b").history(DEFAULT_CHANNEL_ID).len(), 1);
    assert_eq!(room.session("b").history(DEFAULT_CHANNEL_ID)[0].id, sent.id);
}

#[test]
fn host_chat_reaches_every_member() {
    let (mut room, _code) = full_room();
    room.node("h").session.send_chat("welcome").unwrap();
    room.pump();
    for label in ["a", "b", "c"] {
        assert_eq!(room.node(label).chat_texts(), vec!["welcome"]);
    }
}

#[test]
fn chat_validation() {
    let (mut room, _code) = full_room();
    let session = &mut room.node("a").session;
    assert!(matches!(session.send_chat("   "), Err(SessionError::EmptyMessage)));
    let huge = "x".repeat(meshroom_core::MAX_CHAT_TEXT_BYTES + 1);
    assert!(matches!(session.send_chat(&huge), Err(SessionError::MessageTooLarge)));

    let mut idle = Session::new(SessionConfig::new("Zed"), Box::new(SilentTransport));
    assert!(matches!(idle.send_chat("hi"), Err(SessionError::NotConnected)));
}

#[test]
fn late_joiner_receives_history_after_settle_delay() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);
    room.node("h").session.send_chat("first").unwrap();
    room.pump();
    room.node("a").session.send_chat("second").unwrap();
    room.pump();
    room.fire_history_sync();

    room.join("b", "Ben", &code);
    assert!(room.session("b").history(DEFAULT_CHANNEL_ID).is_empty());
    assert_eq!(room.fire_history_sync(), 1);

    let texts: Vec<_> = room
        .session("b")
        .history(DEFAULT_CHANNEL_ID)
        .iter()
        .map(|m| m.text.clone())
        .collect();
    assert_eq!(texts, vec!["first", "second"]);
    assert!(room.node("b").has_notice(|n| matches!(n, SessionNotice::HistoryLoaded { .. })));
}

#[test]
fn messages_sent_before_the_host_link_opens_are_flushed_in_order() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.add("a", "Ann");
    let member = &mut room.node("a").session;
    member.join_room_as(&code, "a").unwrap();
    member.send_chat("one").unwrap();
    member.send_chat("two").unwrap();
    assert_eq!(member.pending_len(), 2);

    room.pump();
    assert_eq!(room.session("a").pending_len(), 0);
    assert_eq!(room.node("h").chat_texts(), vec!["one", "two"]);
}

#[test]
fn channels_replicate_and_keep_their_invariants() {
    let (mut room, _code) = full_room();
    let dev = room.node("h").session.create_channel("dev").unwrap();
    room.pump();
    assert_eq!(room.session("h").active_channel(), dev);
    for label in ["a", "b", "c"] {
        assert!(room.session(label).channels().iter().any(|c| c.id == dev));
        assert_eq!(room.session(label).active_channel(), DEFAULT_CHANNEL_ID);
    }

    let host = &mut room.node("h").session;
    assert!(matches!(
        host.create_channel("DEV"),
        Err(SessionError::DuplicateChannel(_))
    ));
    assert!(matches!(host.create_channel("  "), Err(SessionError::EmptyChannelName)));
    assert!(matches!(
        host.delete_channel(DEFAULT_CHANNEL_ID),
        Err(SessionError::DefaultChannelUndeletable)
    ));
    assert!(matches!(
        room.node("a").session.delete_channel(&dev),
        Err(SessionError::PermissionDenied(_))
    ));

    room.node("h").session.send_chat("in dev").unwrap();
    room.node("b").session.switch_channel(&dev).unwrap();
    room.pump();
    assert_eq!(room.session("a").history(&dev).len(), 1);
    assert!(room.session("a").history(DEFAULT_CHANNEL_ID).is_empty());

    room.clear_notices();
    room.node("h").session.delete_channel(&dev).unwrap();
    room.pump();
    for label in ["h", "a", "b", "c"] {
        let session = room.session(label);
        assert_eq!(session.channels().len(), 1, "{label}");
        assert_eq!(session.active_channel(), DEFAULT_CHANNEL_ID, "{label}");
    }
    assert!(room.node("b").has_notice(|n| matches!(
        n,
        SessionNotice::ActiveChannel { channel_id, .. } if channel_id == DEFAULT_CHANNEL_ID
    )));
}

#[test]
fn channel_names_are_unique_ignoring_case() {
    let (mut room, _code) = full_room();
    let host = &mut room.node("h").session;
    let general = host.create_channel("General").unwrap();
    assert!(matches!(
        host.create_channel("general"),
        Err(SessionError::DuplicateChannel(_))
    ));
    room.pump();
    for label in ["h", "a", "b", "c"] {
        let named: Vec<_> = room
            .session(label)
            .channels()
            .iter()
            .filter(|c| c.id != DEFAULT_CHANNEL_ID)
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();
        assert_eq!(named, vec![(general.clone(), "General".to_owned())], "{label}");
    }
}

#[test]
fn chat_for_an_unknown_channel_lands_in_default() {
    let (mut room, _code) = full_room();
    let stray = ChatMessage {
        id: "m-1".to_owned(),
        author_id: "a".to_owned(),
        author: "Ann".to_owned(),
        text: "lost".to_owned(),
        timestamp: now_unix_ms(),
        channel: "ghost".to_owned(),
    };
    room.node("b").inject(WireMessage::Chat(stray), "h");
    let chats = room.node("b").chats();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].channel, DEFAULT_CHANNEL_ID);
    assert_eq!(room.session("b").history(DEFAULT_CHANNEL_ID).len(), 1);
}

#[test]
fn unknown_message_types_are_ignored() {
    let (mut room, _code) = full_room();
    let raw = Bytes::from_static(br#"{"type":"sticker","pack":"cats","id":7}"#);
    let message = decode_message(&raw).unwrap();
    room.node("h").session.route(message, &raw, "a");
    room.pump();

    for label in ["h", "a", "b", "c"] {
        assert_eq!(room.session(label).state(), ConnectionState::Connected);
        assert!(room.node(label).chats().is_empty());
    }
}

#[test]
fn host_link_that_never_opens_times_out() {
    let mut session = Session::new(SessionConfig::new("Ann"), Box::new(SilentTransport));
    session.join_room_as("abcd", "a").unwrap();
    session.handle_event(SessionEvent::IdentityOpen {
        identity: "a".to_owned(),
    });
    assert_eq!(session.state(), ConnectionState::ConnectingToHost);

    let timer = session
        .take_timers()
        .into_iter()
        .find(|s| matches!(s.timer, Timer::ConnectTimeout { .. }))
        .expect("connect timeout armed");
    assert_eq!(timer.delay, SessionConfig::default().connect_timeout);

    session.handle_event(SessionEvent::Timer(timer.timer));
    assert_eq!(session.state(), ConnectionState::Terminated);
    let notices = session.take_notices();
    assert!(notices.iter().any(|n| matches!(
        n,
        SessionNotice::Error(message) if message.contains("timed out")
    )));
}

#[test]
fn signaling_loss_is_retried_then_given_up() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);

    room.network.disconnect_signaling(&code);
    room.network.set_signaling_available(false);
    room.pump();
    let reconnects = room.fire(|t| matches!(t, Timer::SignalingReconnect { .. }));
    assert_eq!(reconnects, 3);

    let host = room.node("h");
    assert_eq!(host.session.state(), ConnectionState::Terminated);
    assert!(host.has_notice(|n| matches!(
        n,
        SessionNotice::Error(message) if message.contains("signaling")
    )));
}

#[test]
fn signaling_recovers_without_dropping_links() {
    let mut room = Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);

    room.network.disconnect_signaling(&code);
    room.pump();
    assert_eq!(room.fire(|t| matches!(t, Timer::SignalingReconnect { .. })), 1);
    assert!(room.network.is_registered(&code));
    assert_eq!(room.session("h").state(), ConnectionState::Connected);

    room.node("a").session.send_chat("still here").unwrap();
    room.pump();
    assert_eq!(room.node("h").chat_texts(), vec!["still here"]);
}

#[test]
fn leaving_closes_links_and_notifies_the_room() {
    let (mut room, _code) = full_room();
    room.node("b").session.leave();
    room.pump();
    assert_eq!(room.session("b").state(), ConnectionState::Idle);
    for label in ["h", "a", "c"] {
        assert!(room.session(label).peer("b").is_none(), "{label}");
        assert!(room.node(label).has_notice(|n| matches!(
            n,
            SessionNotice::PeerLeft { peer_id, .. } if peer_id == "b"
        )));
    }
}
