mod support;

use meshroom_core::{Role, SystemMessage, WireMessage};
use meshroom_session::{ConnectionState, SessionNotice};
use support::full_room;

#[test]
fn survivors_agree_on_the_smallest_id_after_host_loss() {
    let (mut room, code) = full_room();
    room.crash("h");

    for label in ["a", "b", "c"] {
        let session = room.session(label);
        assert_eq!(session.room_id(), "a", "{label} follows a");
        assert_eq!(session.epoch(), 1, "{label}");
        assert_eq!(session.state(), ConnectionState::Connected, "{label}");
        assert!(session.peer(&code).is_none(), "{label} forgot the old host");
    }
    assert!(room.session("a").is_host());
    assert_eq!(room.session("b").peer("a").map(|p| p.role), Some(Role::Host));
    assert!(room.node("a").has_notice(|n| matches!(
        n,
        SessionNotice::RoleChanged { peer_id, role: Role::Host } if peer_id == "a"
    )));
    for label in ["b", "c"] {
        assert!(room.node(label).has_notice(|n| matches!(
            n,
            SessionNotice::HostChanged { host_id, epoch: 1 } if host_id == "a"
        )));
    }
}

#[test]
fn relay_resumes_through_the_new_host() {
    let (mut room, _code) = full_room();
    room.crash("h");
    room.clear_notices();

    room.node("c").session.send_chat("anyone?").unwrap();
    room.pump();
    assert_eq!(room.node("a").chat_texts(), vec!["anyone?"]);
    assert_eq!(room.node("b").chat_texts(), vec!["anyone?"]);
    assert_eq!(room.node("c").chats().len(), 1);
}

#[test]
fn consecutive_host_losses_advance_the_epoch() {
    let (mut room, _code) = full_room();
    room.crash("h");
    room.crash("a");

    for label in ["b", "c"] {
        let session = room.session(label);
        assert_eq!(session.room_id(), "b", "{label}");
        assert_eq!(session.epoch(), 2, "{label}");
    }
    assert!(room.session("b").is_host());
    assert_eq!(room.session("c").role(), Role::Member);

    room.crash("b");
    let last = room.session("c");
    assert!(last.is_host());
    assert_eq!(last.epoch(), 3);
    assert_eq!(last.state(), ConnectionState::Connected);
}

#[test]
fn stale_host_claims_are_ignored() {
    let (mut room, _code) = full_room();
    room.crash("h");
    room.clear_notices();

    room.node("b").inject(
        WireMessage::System(SystemMessage::HostChange {
            host_id: "c".to_owned(),
            epoch: 0,
        }),
        "c",
    );
    room.node("b").inject(
        WireMessage::System(SystemMessage::HostChange {
            host_id: "z".to_owned(),
            epoch: 1,
        }),
        "c",
    );
    assert_eq!(room.session("b").room_id(), "a");
    assert_eq!(room.session("b").epoch(), 1);
    assert!(!room.node("b").has_notice(|n| matches!(n, SessionNotice::HostChanged { .. })));
}

#[test]
fn newer_host_claim_demotes_a_stale_host() {
    let (mut room, _code) = full_room();
    room.crash("h");
    room.node("a").inject(
        WireMessage::System(SystemMessage::HostChange {
            host_id: "b".to_owned(),
            epoch: 2,
        }),
        "b",
    );
    let session = room.session("a");
    assert!(!session.is_host());
    assert_eq!(session.role(), Role::Admin);
    assert_eq!(session.room_id(), "b");
    assert_eq!(session.epoch(), 2);
}

#[test]
fn member_loss_is_seen_by_everyone_once() {
    let (mut room, _code) = full_room();
    room.crash("b");

    for label in ["h", "a", "c"] {
        let node = room.node(label);
        assert!(node.session.peer("b").is_none(), "{label}");
        let departures = node
            .notices
            .iter()
            .filter(|n| matches!(n, SessionNotice::PeerLeft { peer_id, .. } if peer_id == "b"))
            .count();
        assert_eq!(departures, 1, "{label}");
    }
    assert_eq!(
        room.session("h").linked_peers(),
        vec!["a".to_owned(), "c".to_owned()]
    );
}

#[test]
fn lone_member_becomes_host_of_its_own_room() {
    let mut room = support::Room::new();
    let code = room.host("h", "Hana");
    room.join("a", "Ann", &code);
    room.crash("h");

    let session = room.session("a");
    assert!(session.is_host());
    assert_eq!(session.epoch(), 1);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(session.linked_peers().is_empty());
}
