//! Cluster state and the five protocol actions.
//!
//! [`ClusterState`] is one process's view of the whole cluster. It only
//! changes through the actions below and through the promise/replica
//! bookkeeping the transport performs when messages arrive. Every action
//! checks its guard first and either applies its whole effect or returns
//! [`GuardFailed`] without touching anything.
//!
//! `ClusterState` does no locking of its own. Callers serialize access; the
//! transport keeps it behind a single mutex.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::codec::{Message, MessageKind, Value};
use crate::error::GuardFailed;

pub type AcceptorId = u8;
pub type Term = u32;

/// Largest cluster the 1-byte `sender` field can address.
pub const MAX_CLUSTER_SIZE: usize = AcceptorId::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptor {
    pub id: AcceptorId,
    pub role: Role,
    /// Highest term this acceptor has promised. `None` until its first promise.
    pub promised_term: Option<Term>,
    pub log: Vec<Value>,
}

impl Acceptor {
    fn new(id: AcceptorId) -> Self {
        Self {
            id,
            role: Role::Follower,
            promised_term: None,
            log: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterState {
    size: usize,
    acceptors: BTreeMap<AcceptorId, Acceptor>,
    leader_id: AcceptorId,
    term: Term,
    quorum: BTreeSet<AcceptorId>,
    message_log: Vec<Message>,
    /// The highest term this node has granted, and to which candidate.
    granted: Option<(Term, AcceptorId)>,
}

impl ClusterState {
    /// Creates the bootstrap state for an `n`-node cluster.
    ///
    /// Acceptor 0 starts as Leader in term 0. The quorum is the lowest
    /// `n / 2 + 1` ids and never changes.
    ///
    /// Returns `None` when `n` is zero or larger than [`MAX_CLUSTER_SIZE`].
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 || size > MAX_CLUSTER_SIZE {
            return None;
        }

        let mut acceptors: BTreeMap<AcceptorId, Acceptor> = (0..size)
            .map(|i| {
                let id = i as AcceptorId;
                (id, Acceptor::new(id))
            })
            .collect();
        if let Some(bootstrap) = acceptors.get_mut(&0) {
            bootstrap.role = Role::Leader;
        }

        let quorum = (0..=size / 2).map(|i| i as AcceptorId).collect();

        Some(Self {
            size,
            acceptors,
            leader_id: 0,
            term: 0,
            quorum,
            message_log: Vec::new(),
            granted: None,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader_id(&self) -> AcceptorId {
        self.leader_id
    }

    pub fn quorum(&self) -> &BTreeSet<AcceptorId> {
        &self.quorum
    }

    pub fn acceptor(&self, id: AcceptorId) -> Option<&Acceptor> {
        self.acceptors.get(&id)
    }

    pub fn acceptors(&self) -> impl Iterator<Item = &Acceptor> {
        self.acceptors.values()
    }

    pub fn message_log(&self) -> &[Message] {
        &self.message_log
    }

    pub fn granted(&self) -> Option<(Term, AcceptorId)> {
        self.granted
    }

    pub fn is_leader(&self, id: AcceptorId) -> bool {
        self.leader_id == id && self.role_of(id) == Some(Role::Leader)
    }

    fn role_of(&self, id: AcceptorId) -> Option<Role> {
        self.acceptors.get(&id).map(|acceptor| acceptor.role)
    }

    fn acceptor_mut(&mut self, id: AcceptorId) -> Result<&mut Acceptor, GuardFailed> {
        self.acceptors
            .get_mut(&id)
            .ok_or(GuardFailed::UnknownAcceptor(id))
    }

    fn demote_leaders(&mut self) {
        for acceptor in self.acceptors.values_mut() {
            if acceptor.role == Role::Leader {
                acceptor.role = Role::Follower;
            }
        }
    }

    /// PromoteCandidate: a Follower becomes a Candidate.
    pub fn promote_candidate(&mut self, id: AcceptorId) -> Result<(), GuardFailed> {
        let acceptor = self.acceptor_mut(id)?;
        if acceptor.role != Role::Follower {
            return Err(GuardFailed::NotFollower {
                id,
                role: acceptor.role,
            });
        }
        acceptor.role = Role::Candidate;
        Ok(())
    }

    /// LeaderElection: a Candidate whose whole quorum promised in the current
    /// term takes the bullet and opens the next term.
    pub fn leader_election(&mut self, candidate: AcceptorId) -> Result<(), GuardFailed> {
        let role = self
            .role_of(candidate)
            .ok_or(GuardFailed::UnknownAcceptor(candidate))?;
        if role != Role::Candidate {
            return Err(GuardFailed::NotCandidate {
                id: candidate,
                role,
            });
        }
        for &q in &self.quorum {
            let promised = self.acceptors.get(&q).and_then(|a| a.promised_term);
            if promised != Some(self.term) {
                return Err(GuardFailed::QuorumNotPromised {
                    acceptor: q,
                    promised,
                    term: self.term,
                });
            }
        }
        let next_term = self
            .term
            .checked_add(1)
            .ok_or(GuardFailed::TermExhausted(self.term))?;

        self.demote_leaders();
        self.acceptor_mut(candidate)?.role = Role::Leader;
        self.leader_id = candidate;
        self.term = next_term;
        Ok(())
    }

    /// LogReplication: the leader copies its log verbatim into every quorum
    /// member and records the matching accept message.
    ///
    /// Returns the accept message so the caller can push it to peers.
    /// Refuses with `DecreeChosen` when the current term already recorded an
    /// accept for a different log.
    pub fn log_replication(&mut self) -> Result<Message, GuardFailed> {
        if !self.is_leader(self.leader_id) {
            return Err(GuardFailed::NoLeader(self.leader_id));
        }
        let log = self
            .acceptors
            .get(&self.leader_id)
            .map(|leader| leader.log.clone())
            .unwrap_or_default();
        if self.chosen_accept().is_some_and(|chosen| chosen.values != log) {
            return Err(GuardFailed::DecreeChosen(self.term));
        }

        for q in &self.quorum {
            if let Some(member) = self.acceptors.get_mut(q) {
                member.log.clone_from(&log);
            }
        }

        let message = Message::accept(self.leader_id, self.term, log);
        self.message_log.push(message.clone());
        Ok(message)
    }

    /// MessageBroadcast: garbage-collects one stale prepare once no quorum
    /// member leads.
    ///
    /// `Ok(None)` means the guard held but there was nothing to collect.
    pub fn message_broadcast(&mut self) -> Result<Option<Message>, GuardFailed> {
        if let Some(leader) = self
            .quorum
            .iter()
            .copied()
            .find(|q| self.role_of(*q) == Some(Role::Leader))
        {
            return Err(GuardFailed::QuorumHasLeader(leader));
        }
        let stale = self
            .message_log
            .iter()
            .position(|m| m.kind == MessageKind::Prepare);
        Ok(stale.map(|index| self.message_log.remove(index)))
    }

    /// MagicBulletPass: the leader hands the bullet to another acceptor
    /// without a new election. The term does not change.
    pub fn magic_bullet_pass(&mut self, new_leader: AcceptorId) -> Result<(), GuardFailed> {
        if !self.acceptors.contains_key(&new_leader) {
            return Err(GuardFailed::UnknownAcceptor(new_leader));
        }
        if new_leader == self.leader_id {
            return Err(GuardFailed::AlreadyLeader(new_leader));
        }
        if !self.is_leader(self.leader_id) {
            return Err(GuardFailed::NoLeader(self.leader_id));
        }

        self.demote_leaders();
        self.acceptor_mut(new_leader)?.role = Role::Leader;
        self.leader_id = new_leader;
        Ok(())
    }

    /// Appends `value` to the leader's log and replicates it as this term's
    /// decree.
    ///
    /// Returns the accept message for the caller to push to peers. Nothing
    /// changes when a guard fails.
    ///
    /// # Why one decree per term?
    ///
    /// Terms are the only ballot numbers this protocol has. A second accept
    /// in the same term would carry a longer log under a ballot peers already
    /// accepted, and two accept messages of one term with different values
    /// are exactly what LogConsistency forbids. A leader with more to say
    /// waits for the next term.
    pub fn propose(&mut self, value: Value) -> Result<Message, GuardFailed> {
        if !self.is_leader(self.leader_id) {
            return Err(GuardFailed::NoLeader(self.leader_id));
        }
        if self.decree_chosen() {
            return Err(GuardFailed::DecreeChosen(self.term));
        }
        self.append_to_leader(value)?;
        self.log_replication()
    }

    /// Records that `id` promised `term`. Promises never move backwards.
    ///
    /// Returns `false`, leaving the state untouched, when `id` is unknown or
    /// has already promised a higher term.
    pub(crate) fn promise(&mut self, id: AcceptorId, term: Term) -> bool {
        match self.acceptors.get_mut(&id) {
            Some(acceptor) if acceptor.promised_term.map_or(true, |p| term >= p) => {
                acceptor.promised_term = Some(term);
                true
            }
            _ => false,
        }
    }

    /// Decides whether this node answers `candidate`'s prepare for `term`.
    ///
    /// A term is granted to one candidate only, and only while it is newer
    /// than the term this view already reached. The same candidate may ask
    /// again, so a retried prepare gets the same answer.
    ///
    /// # Why not grant every prepare at or above the promised term?
    ///
    /// Ballots here are bare terms with no proposer id to break ties. Two
    /// candidates promised the same term by overlapping quorums would both
    /// win it. A refused candidate moves to a higher term instead (see
    /// [`term_floor`](Self::term_floor)).
    pub(crate) fn grant_promise(&mut self, candidate: AcceptorId, term: Term) -> bool {
        if term <= self.term || !self.acceptors.contains_key(&candidate) {
            return false;
        }
        let allowed = match self.granted {
            None => true,
            Some((granted, to)) => term > granted || (term == granted && to == candidate),
        };
        if allowed {
            self.granted = Some((term, candidate));
        }
        allowed
    }

    /// The term a prepare from `candidate` has to build on.
    ///
    /// Normally the current term. When this view has granted a higher term
    /// to someone else, that grant is the floor, so the next prepare asks for
    /// a term nobody here holds yet. A candidate's own earlier grant is
    /// reused so retries keep asking for the same term.
    pub fn term_floor(&self, candidate: AcceptorId) -> Term {
        match self.granted {
            Some((granted, to)) if to == candidate => granted.saturating_sub(1).max(self.term),
            Some((granted, _)) => granted.max(self.term),
            None => self.term,
        }
    }

    /// Moves the term forward to `term`. Lower terms are ignored.
    ///
    /// Used when a peer refused a prepare: the refusal means the term was
    /// already taken, so the next attempt has to start above it.
    pub(crate) fn advance_term(&mut self, term: Term) -> bool {
        if term <= self.term {
            return false;
        }
        self.term = term;
        true
    }

    /// Counts a promise for `proposed_term` toward the election that would
    /// close the current term.
    ///
    /// # Why map the term?
    ///
    /// Prepares carry `term + 1`, the term the candidate wants to open, while
    /// [`leader_election`](Self::leader_election) checks promises against
    /// the term it is closing. A promise for exactly `term + 1` is therefore
    /// stored as a promise in the current term. Promises for any other term
    /// are stale or premature and are ignored.
    pub(crate) fn record_promise(&mut self, id: AcceptorId, proposed_term: Term) -> bool {
        if self.term.checked_add(1) != Some(proposed_term) {
            return false;
        }
        self.promise(id, self.term)
    }

    /// Takes a leader's accept message as this node's authoritative log.
    ///
    /// Refused when the accept is from an older term, when `local_id`
    /// promised a newer term, or when this term already has a different
    /// accepted decree. Otherwise the local log is overwritten, the term is
    /// adopted, and the sender becomes the leader in this view.
    pub(crate) fn accept_replica(&mut self, local_id: AcceptorId, accept: &Message) -> bool {
        if accept.kind != MessageKind::Accept || accept.term < self.term {
            return false;
        }
        if !self.acceptors.contains_key(&accept.sender) {
            return false;
        }
        let conflicting = self
            .message_log
            .iter()
            .any(|m| m.kind == MessageKind::Accept && m.term == accept.term && m.values != accept.values);
        if conflicting {
            return false;
        }
        let Some(local) = self.acceptors.get_mut(&local_id) else {
            return false;
        };
        if local.promised_term.is_some_and(|p| p > accept.term) {
            return false;
        }
        local.log.clone_from(&accept.values);

        self.term = accept.term;
        if !self.is_leader(accept.sender) {
            self.demote_leaders();
            if let Some(sender) = self.acceptors.get_mut(&accept.sender) {
                sender.role = Role::Leader;
            }
            self.leader_id = accept.sender;
        }
        true
    }

    fn append_to_leader(&mut self, value: Value) -> Result<(), GuardFailed> {
        if !self.is_leader(self.leader_id) {
            return Err(GuardFailed::NoLeader(self.leader_id));
        }
        self.acceptor_mut(self.leader_id)?.log.push(value);
        Ok(())
    }

    /// The accept message recorded for the current term, if any.
    pub fn chosen_accept(&self) -> Option<&Message> {
        self.message_log
            .iter()
            .find(|m| m.kind == MessageKind::Accept && m.term == self.term)
    }

    /// Whether an accept message for the current term was already recorded.
    pub fn decree_chosen(&self) -> bool {
        self.chosen_accept().is_some()
    }

    /// Whether every quorum member has promised in the current term.
    pub fn quorum_promised(&self) -> bool {
        self.quorum.iter().all(|q| {
            self.acceptors.get(q).and_then(|a| a.promised_term) == Some(self.term)
        })
    }

    /// Appends an observed or sent message to the audit log.
    pub(crate) fn observe(&mut self, message: Message) {
        self.message_log.push(message);
    }
}
