//! End-to-end walks through the protocol actions on a three-node view.
//!
//! Elections need promises, which only arrive over the wire; those run in
//! `cluster.rs`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use bullet_protocol::codec::{self, Message, MessageKind};
use bullet_protocol::config::NodeConfig;
use bullet_protocol::error::GuardFailed;
use bullet_protocol::safety::{check_log_consistency, check_one_leader};
use bullet_protocol::state::ClusterState;
use bullet_protocol::transport::{ACK, NACK, Transport};

fn three() -> ClusterState {
    ClusterState::new(3).expect("3 is a valid cluster size")
}

#[test]
fn test_replication_reaches_quorum_only() {
    let mut state = three();
    let accept = state.propose(json!("v1")).unwrap();

    assert_eq!(state.acceptor(0).unwrap().log, vec![json!("v1")]);
    assert_eq!(state.acceptor(1).unwrap().log, vec![json!("v1")]);
    assert!(state.acceptor(2).unwrap().log.is_empty());

    let accepts: Vec<&Message> = state
        .message_log()
        .iter()
        .filter(|m| m.kind == MessageKind::Accept)
        .collect();
    assert_eq!(accepts, vec![&accept]);
    assert_eq!(accept.values, vec![json!("v1")]);
    assert!(check_log_consistency(&state));

    // Replicating again in the same term resends the same decree.
    assert_eq!(state.log_replication().unwrap(), accept);
    assert_eq!(state.propose(json!("v2")), Err(GuardFailed::DecreeChosen(0)));
    assert!(check_log_consistency(&state));
}

#[test]
fn test_magic_bullet_pass_guards() {
    let mut state = three();
    assert_eq!(state.magic_bullet_pass(0), Err(GuardFailed::AlreadyLeader(0)));

    state.magic_bullet_pass(2).unwrap();
    assert_eq!(state.leader_id(), 2);
    assert_eq!(state.term(), 0);
    assert!(check_one_leader(&state));
}

#[test]
fn test_corrupt_accept_leaves_peer_log_untouched() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let config = NodeConfig::new(1, 3, "127.0.0.1:0", BTreeMap::new())
        .with_send_timeout(Duration::from_millis(500));
    let peer = Transport::start(listener, config)?;

    let mut bytes = codec::encode(&Message::accept(0, 0, vec![json!("v1")]))?;
    let tag_start = bytes.len() - codec::TAG_LEN;
    bytes[tag_start] = if bytes[tag_start] == b'a' { b'b' } else { b'a' };

    let mut stream = TcpStream::connect(peer.local_addr())?;
    codec::write_frame(&mut stream, &bytes)?;
    stream.flush()?;
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply)?;
    assert_eq!(reply[0], NACK);

    peer.view(|state| {
        assert!(state.acceptor(1).unwrap().log.is_empty());
        assert_eq!(state.leader_id(), 0);
    });

    // The same message with its tag intact goes through.
    let bytes = codec::encode(&Message::accept(0, 0, vec![json!("v1")]))?;
    let mut stream = TcpStream::connect(peer.local_addr())?;
    codec::write_frame(&mut stream, &bytes)?;
    stream.read_exact(&mut reply)?;
    assert_eq!(reply[0], ACK);
    peer.view(|state| {
        assert_eq!(state.acceptor(1).unwrap().log, vec![json!("v1")]);
    });
    Ok(())
}
