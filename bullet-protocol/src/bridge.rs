//! The operations a client drives a node with.
//!
//! A [`Bridge`] owns a node's [`Transport`] and turns client intent into
//! protocol actions: it runs the action under the state lock, releases the
//! lock, then pushes whatever message the action produced to the quorum.
//! After every mutating call it re-checks both safety invariants.

use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Message, Value};
use crate::config::NodeConfig;
use crate::error::{BulletError, GuardFailed, SafetyViolation};
use crate::safety;
use crate::state::{AcceptorId, Role, Term};
use crate::transport::Transport;

/// Snapshot of a node's view, as printed by the shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub node_id: AcceptorId,
    pub role: Role,
    pub term: Term,
    pub leader_id: AcceptorId,
    pub log_length: usize,
    pub quorum: Vec<AcceptorId>,
    pub safety_ok: bool,
    pub safety_reason: String,
    pub peers: usize,
    pub messages: usize,
}

pub struct Bridge {
    transport: Transport,
    promise_wait: Duration,
}

impl Bridge {
    /// Binds `config.listen` and starts the node.
    pub fn bind(config: NodeConfig) -> Result<Self, BulletError> {
        let promise_wait = config.promise_wait;
        Ok(Self {
            transport: Transport::bind(config)?,
            promise_wait,
        })
    }

    /// Starts the node on a listener the caller already bound.
    pub fn from_listener(listener: TcpListener, config: NodeConfig) -> Result<Self, BulletError> {
        let promise_wait = config.promise_wait;
        Ok(Self {
            transport: Transport::start(listener, config)?,
            promise_wait,
        })
    }

    pub fn node_id(&self) -> AcceptorId {
        self.transport.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// This node's own copy of the replicated log.
    pub fn log(&self) -> Vec<Value> {
        let id = self.node_id();
        self.transport.view(|state| {
            state
                .acceptor(id)
                .map(|me| me.log.clone())
                .unwrap_or_default()
        })
    }

    /// Appends `value` to the leader's log and replicates it.
    ///
    /// Only the current leader may propose, and only once per term (see
    /// [`ClusterState::propose`](crate::state::ClusterState::propose)). If
    /// this term's decree already ends in `value`, the recorded accept is sent
    /// again instead, so a proposal that missed its majority can be retried.
    pub fn propose_value(&self, value: Value) -> Result<(), BulletError> {
        let id = self.node_id();
        let accept = self.transport.with_state(|state| -> Result<Message, BulletError> {
            if !state.is_leader(id) {
                return Err(BulletError::NotLeader {
                    node: id,
                    leader: state.leader_id(),
                });
            }
            if let Some(chosen) = state.chosen_accept() {
                if chosen.sender == id && chosen.values.last() == Some(&value) {
                    debug!(node = id, term = chosen.term, "resending chosen decree");
                    return Ok(chosen.clone());
                }
                return Err(GuardFailed::DecreeChosen(state.term()).into());
            }

            // Refuse before mutating anything if the grown log will not fit
            // in one frame.
            let mut grown = state
                .acceptor(id)
                .map(|me| me.log.clone())
                .unwrap_or_default();
            grown.push(value.clone());
            codec::encode(&Message::accept(id, state.term(), grown))?;

            Ok(state.propose(value)?)
        })?;
        self.check_safety()?;

        let acks = self.transport.broadcast_to_quorum(&accept)?;
        info!(
            node = id,
            term = accept.term,
            log_length = accept.values.len(),
            acks,
            "value replicated"
        );
        Ok(())
    }

    /// Runs for leader of the next free term.
    ///
    /// Promotes this node to candidate (or resumes an earlier candidacy),
    /// sends a prepare to the quorum and waits up to the configured promise
    /// window for every quorum member to promise. If the election guard still
    /// fails afterwards, one stale prepare is collected where possible and the
    /// guard failure is returned.
    ///
    /// # Why a term floor?
    ///
    /// A term granted to one candidate is never granted to another. If that
    /// candidate dies mid-election, asking for `term + 1` again would be
    /// refused forever. The prepare therefore builds on the highest term this
    /// view knows is taken, and a refused attempt moves the view to the
    /// refused term so the next call asks for a higher one.
    pub fn request_leadership(&self) -> Result<(), BulletError> {
        let id = self.node_id();
        let prepare = self.transport.with_state(|state| {
            let role = state
                .acceptor(id)
                .map(|me| me.role)
                .ok_or(GuardFailed::UnknownAcceptor(id))?;
            if role == Role::Leader {
                return Err(GuardFailed::NotFollower { id, role });
            }
            let floor = state.term_floor(id);
            let proposed = floor
                .checked_add(1)
                .ok_or(GuardFailed::TermExhausted(floor))?;

            match role {
                Role::Candidate => debug!(node = id, term = state.term(), "resuming candidacy"),
                _ => state.promote_candidate(id)?,
            }
            state.advance_term(floor);
            state.grant_promise(id, proposed);
            state.record_promise(id, proposed);

            let prepare = Message::prepare(id, proposed);
            state.observe(prepare.clone());
            Ok::<_, GuardFailed>(prepare)
        })?;

        while self.transport.promises().try_recv().is_ok() {}

        let report = self.transport.send_to_quorum(&prepare)?;
        if report.has_majority() {
            debug!(node = id, term = prepare.term, acks = report.acks, "prepare acknowledged");
            if !self.await_promises() {
                debug!(node = id, term = prepare.term, "promise window elapsed");
            }
        } else {
            warn!(
                node = id,
                term = prepare.term,
                acks = report.acks,
                needed = report.needed,
                rejected = ?report.rejected,
                "prepare did not reach a majority"
            );
        }

        let outcome = self.transport.with_state(|state| {
            let result = state.leader_election(id);
            if result.is_err() {
                if !report.rejected.is_empty() && state.advance_term(prepare.term) {
                    debug!(node = id, term = prepare.term, "term taken, next attempt goes higher");
                }
                if let Ok(Some(stale)) = state.message_broadcast() {
                    debug!(from = stale.sender, term = stale.term, "collected stale prepare");
                }
            }
            result.map(|()| state.term())
        });
        self.check_safety()?;

        let term = outcome?;
        info!(node = id, term, "won leadership");
        Ok(())
    }

    /// Blocks until every quorum member has promised or the window closes.
    fn await_promises(&self) -> bool {
        let deadline = Instant::now() + self.promise_wait;
        loop {
            if self.transport.view(|state| state.quorum_promised()) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.transport.promises().recv_timeout(remaining) {
                Ok(notice) => debug!(from = notice.from, term = notice.term, "promise received"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Hands the bullet to `target` without an election.
    ///
    /// The change is local to this node's view; `target` learns it leads when
    /// its own view is updated.
    pub fn transfer_leadership(&self, target: AcceptorId) -> Result<(), BulletError> {
        let id = self.node_id();
        self.transport.with_state(|state| -> Result<(), BulletError> {
            if !state.is_leader(id) {
                return Err(BulletError::NotLeader {
                    node: id,
                    leader: state.leader_id(),
                });
            }
            state.magic_bullet_pass(target)?;
            Ok(())
        })?;
        self.check_safety()?;
        info!(from = id, to = target, "bullet passed");
        Ok(())
    }

    pub fn status(&self) -> StatusRecord {
        let id = self.node_id();
        let peers = self.transport.peer_count();
        self.transport.view(|state| {
            let me = state.acceptor(id);
            let verdict = safety::check_safety(state);
            StatusRecord {
                node_id: id,
                role: me.map_or(Role::Follower, |me| me.role),
                term: state.term(),
                leader_id: state.leader_id(),
                log_length: me.map_or(0, |me| me.log.len()),
                quorum: state.quorum().iter().copied().collect(),
                safety_ok: verdict.is_ok(),
                safety_reason: safety::safety_reason(state),
                peers,
                messages: state.message_log().len(),
            }
        })
    }

    /// Checks both invariants against the current view.
    pub fn check_safety(&self) -> Result<(), SafetyViolation> {
        let verdict = self.transport.view(safety::check_safety);
        if let Err(violation) = &verdict {
            error!(node = self.node_id(), %violation, "safety invariant violated");
        }
        verdict
    }

    pub fn shutdown(&mut self) {
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;

    use crate::codec::MessageKind;
    use crate::error::CodecError;

    fn solo(cluster_size: usize, id: AcceptorId) -> Bridge {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = NodeConfig::new(id, cluster_size, "127.0.0.1:0", BTreeMap::new())
            .with_send_timeout(Duration::from_millis(300))
            .with_promise_wait(Duration::from_millis(100));
        Bridge::from_listener(listener, config).unwrap()
    }

    #[test]
    fn test_single_node_proposes() {
        let node = solo(1, 0);
        node.propose_value(json!("v1")).unwrap();

        assert_eq!(node.log(), vec![json!("v1")]);
        let status = node.status();
        assert_eq!(status.log_length, 1);
        assert!(status.safety_ok);
        assert_eq!(status.safety_reason, "Safety OK");
    }

    #[test]
    fn test_one_decree_per_term() {
        let node = solo(1, 0);
        node.propose_value(json!(1)).unwrap();
        assert!(matches!(
            node.propose_value(json!(2)),
            Err(BulletError::GuardFailed(GuardFailed::DecreeChosen(0)))
        ));
        assert_eq!(node.log(), vec![json!(1)]);
    }

    #[test]
    fn test_repeated_value_resends_decree() {
        let node = solo(1, 0);
        node.propose_value(json!("v1")).unwrap();
        node.propose_value(json!("v1")).unwrap();

        assert_eq!(node.log(), vec![json!("v1")]);
        node.transport().view(|state| {
            let accepts = state
                .message_log()
                .iter()
                .filter(|m| m.kind == MessageKind::Accept)
                .count();
            assert_eq!(accepts, 1);
        });
    }

    #[test]
    fn test_follower_cannot_propose() {
        let node = solo(3, 1);
        assert!(matches!(
            node.propose_value(json!("v1")),
            Err(BulletError::NotLeader { node: 1, leader: 0 })
        ));
        assert!(node.log().is_empty());
        assert_eq!(node.status().messages, 0);
    }

    #[test]
    fn test_oversized_proposal_leaves_state_untouched() {
        let node = solo(1, 0);
        let huge = json!("x".repeat(usize::from(u16::MAX)));
        assert!(matches!(
            node.propose_value(huge),
            Err(BulletError::Codec(CodecError::PayloadTooLarge { .. }))
        ));
        assert!(node.log().is_empty());
        assert_eq!(node.status().messages, 0);
    }

    #[test]
    fn test_leader_cannot_request_leadership() {
        let node = solo(3, 0);
        assert!(matches!(
            node.request_leadership(),
            Err(BulletError::GuardFailed(GuardFailed::NotFollower { id: 0, .. }))
        ));
    }

    #[test]
    fn test_lone_candidate_times_out() {
        let node = solo(3, 2);
        let err = node.request_leadership().unwrap_err();
        assert!(matches!(
            err,
            BulletError::GuardFailed(GuardFailed::QuorumNotPromised { .. })
        ));

        let status = node.status();
        assert_eq!(status.role, Role::Candidate);
        assert_eq!(status.term, 0);
        assert_eq!(status.leader_id, 0);

        // A second attempt resumes the candidacy instead of failing the
        // Follower guard.
        assert!(matches!(
            node.request_leadership(),
            Err(BulletError::GuardFailed(GuardFailed::QuorumNotPromised { .. }))
        ));
        node.transport().view(|state| {
            let prepares = state
                .message_log()
                .iter()
                .filter(|m| m.kind == MessageKind::Prepare)
                .count();
            assert_eq!(prepares, 2);
        });
    }

    #[test]
    fn test_transfer_leadership() {
        let node = solo(3, 0);
        node.transfer_leadership(2).unwrap();
        let status = node.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.leader_id, 2);
        assert_eq!(status.term, 0);

        assert!(matches!(
            node.transfer_leadership(1),
            Err(BulletError::NotLeader { node: 0, leader: 2 })
        ));
    }

    #[test]
    fn test_transfer_to_unknown_acceptor() {
        let node = solo(1, 0);
        assert!(matches!(
            node.transfer_leadership(1),
            Err(BulletError::GuardFailed(GuardFailed::UnknownAcceptor(1)))
        ));
    }

    #[test]
    fn test_status_serializes() {
        let node = solo(5, 3);
        let status = serde_json::to_value(node.status()).unwrap();
        assert_eq!(status["node_id"], json!(3));
        assert_eq!(status["role"], json!("Follower"));
        assert_eq!(status["quorum"], json!([0, 1, 2]));
        assert_eq!(status["safety_ok"], json!(true));
    }
}
