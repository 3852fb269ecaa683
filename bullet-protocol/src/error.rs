//! Error taxonomy for the Bullet protocol.
//!
//! Every kind here is recoverable except [`BulletError::Bind`], which can only
//! happen while a node is starting up.

use std::io;

use thiserror::Error;

use crate::state::{AcceptorId, Role, Term};

/// Decode or encode failure on a protocol frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Received bytes that do not form a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// An action's precondition was not met.
///
/// This is an expected outcome of normal contention. Callers retry later or
/// fall back to a different action.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardFailed {
    #[error("acceptor {0} is not a member of this cluster")]
    UnknownAcceptor(AcceptorId),

    #[error("acceptor {id} is {role:?}, expected Follower")]
    NotFollower { id: AcceptorId, role: Role },

    #[error("acceptor {id} is {role:?}, expected Candidate")]
    NotCandidate { id: AcceptorId, role: Role },

    #[error("quorum member {acceptor} has promised {promised:?}, election needs term {term}")]
    QuorumNotPromised {
        acceptor: AcceptorId,
        promised: Option<Term>,
        term: Term,
    },

    #[error("term {0} cannot be advanced any further")]
    TermExhausted(Term),

    #[error("bullet holder {0} does not have the Leader role")]
    NoLeader(AcceptorId),

    #[error("quorum member {0} is still Leader")]
    QuorumHasLeader(AcceptorId),

    #[error("acceptor {0} already holds the bullet")]
    AlreadyLeader(AcceptorId),

    #[error("a decree was already chosen in term {0}")]
    DecreeChosen(Term),
}

/// Failure to deliver a message to a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address configured for peer {0}")]
    UnknownPeer(AcceptorId),

    #[error("address {addr} for peer {peer} did not resolve")]
    Unresolvable { peer: AcceptorId, addr: String },

    #[error("i/o with peer {peer} failed: {source}")]
    Io {
        peer: AcceptorId,
        #[source]
        source: io::Error,
    },

    #[error("peer {0} rejected the message")]
    Rejected(AcceptorId),

    #[error("only {acks} of {needed} required acknowledgements arrived")]
    NoMajority { acks: usize, needed: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A safety invariant does not hold.
///
/// Actions alone cannot produce this. Seeing one means some code mutated state
/// behind the actions' back or skipped the state lock.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafetyViolation {
    #[error("OneLeader violated: acceptors {leaders:?} all hold the Leader role")]
    OneLeader { leaders: Vec<AcceptorId> },

    #[error("LogConsistency violated: accept messages for term {term} carry different values")]
    LogConsistency { term: Term },
}

/// Top-level error returned by the bridge.
#[derive(Debug, Error)]
pub enum BulletError {
    /// A frame failed to decode, or a payload outgrew the wire format.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    GuardFailed(#[from] GuardFailed),

    #[error(transparent)]
    TransportFailure(#[from] TransportError),

    #[error(transparent)]
    SafetyViolation(#[from] SafetyViolation),

    #[error("node {node} is not the leader (bullet is held by {leader})")]
    NotLeader { node: AcceptorId, leader: AcceptorId },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
