//! Runtime checks for the two safety invariants.
//!
//! The action guards already keep these true. The checks exist so callers and
//! tests can assert them continuously instead of trusting the guards.

use std::collections::HashMap;

use crate::codec::{MessageKind, Value};
use crate::error::SafetyViolation;
use crate::state::{AcceptorId, ClusterState, Role, Term};

/// OneLeader: at most one acceptor holds the Leader role.
pub fn check_one_leader(state: &ClusterState) -> bool {
    state
        .acceptors()
        .filter(|acceptor| acceptor.role == Role::Leader)
        .count()
        <= 1
}

/// LogConsistency: all accept messages of one term carry the same values.
pub fn check_log_consistency(state: &ClusterState) -> bool {
    first_inconsistent_term(state).is_none()
}

fn first_inconsistent_term(state: &ClusterState) -> Option<Term> {
    let mut chosen: HashMap<Term, &[Value]> = HashMap::new();
    for message in state
        .message_log()
        .iter()
        .filter(|m| m.kind == MessageKind::Accept)
    {
        match chosen.get(&message.term) {
            Some(values) if *values != message.values.as_slice() => return Some(message.term),
            Some(_) => {}
            None => {
                chosen.insert(message.term, &message.values);
            }
        }
    }
    None
}

/// Both invariants, reporting the first one that fails.
pub fn check_safety(state: &ClusterState) -> Result<(), SafetyViolation> {
    if !check_one_leader(state) {
        let leaders: Vec<AcceptorId> = state
            .acceptors()
            .filter(|acceptor| acceptor.role == Role::Leader)
            .map(|acceptor| acceptor.id)
            .collect();
        return Err(SafetyViolation::OneLeader { leaders });
    }
    if let Some(term) = first_inconsistent_term(state) {
        return Err(SafetyViolation::LogConsistency { term });
    }
    Ok(())
}

/// Human-readable verdict: `"Safety OK"` or the violated invariant.
pub fn safety_reason(state: &ClusterState) -> String {
    match check_safety(state) {
        Ok(()) => "Safety OK".to_string(),
        Err(violation) => violation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;
    use serde_json::json;

    #[test]
    fn test_fresh_state_is_safe() {
        let state = ClusterState::new(5).unwrap();
        assert!(check_one_leader(&state));
        assert!(check_log_consistency(&state));
        assert_eq!(check_safety(&state), Ok(()));
        assert_eq!(safety_reason(&state), "Safety OK");
    }

    #[test]
    fn test_detects_conflicting_accepts() {
        let mut state = ClusterState::new(3).unwrap();
        state.observe(Message::accept(0, 2, vec![json!("a")]));
        state.observe(Message::accept(1, 3, vec![json!("b")]));
        state.observe(Message::accept(0, 2, vec![json!("a")]));
        assert!(check_log_consistency(&state));

        state.observe(Message::accept(1, 2, vec![json!("b")]));
        assert!(!check_log_consistency(&state));
        assert_eq!(
            check_safety(&state),
            Err(SafetyViolation::LogConsistency { term: 2 })
        );
        assert!(safety_reason(&state).starts_with("LogConsistency violated"));
    }

    #[test]
    fn test_other_message_kinds_do_not_count() {
        let mut state = ClusterState::new(3).unwrap();
        state.observe(Message::promise(1, 1, vec![json!("x")]));
        state.observe(Message::promise(2, 1, vec![json!("y")]));
        state.observe(Message::accepted(1, 1, vec![json!("x")]));
        state.observe(Message::accept(0, 1, vec![json!("y")]));
        assert!(check_log_consistency(&state));
    }

    #[test]
    fn test_accepting_a_newer_leader_keeps_one_leader() {
        let mut state = ClusterState::new(3).unwrap();
        assert!(state.accept_replica(0, &Message::accept(2, 1, vec![])));
        assert!(check_one_leader(&state));
        assert_eq!(state.leader_id(), 2);
    }
}
