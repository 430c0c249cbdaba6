//! Node status state machine.
//!
//! The single source of truth for transition legality. Every write path —
//! store patches, callbacks, retries, resumes — validates against this
//! table with no exceptions; nothing else is allowed to decide whether a
//! status change is legal.

use thiserror::Error;

use crate::types::NodeStatus;

/// Attempted a status change not present in the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Whether `from -> to` is a legal status transition.
///
/// Completed is terminal: nothing transitions out of it. Failed and
/// WaitingForUser re-enter Running via retry and resume respectively.
pub fn is_valid_transition(from: NodeStatus, to: NodeStatus) -> bool {
    use NodeStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, WaitingForUser)
            | (Failed, Running)
            | (WaitingForUser, Running)
    )
}

/// Validate a transition, returning [`IllegalTransition`] when the edge is
/// absent from the table.
pub fn validate(from: NodeStatus, to: NodeStatus) -> Result<(), IllegalTransition> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use NodeStatus::*;

    const ALL: [NodeStatus; 5] = [Pending, Running, Completed, Failed, WaitingForUser];

    const LEGAL: [(NodeStatus, NodeStatus); 6] = [
        (Pending, Running),
        (Running, Completed),
        (Running, Failed),
        (Running, WaitingForUser),
        (Failed, Running),
        (WaitingForUser, Running),
    ];

    #[test]
    fn exactly_the_declared_edges_are_legal() {
        for from in ALL {
            for to in ALL {
                let expected = LEGAL.contains(&(from, to));
                assert_eq!(
                    is_valid_transition(from, to),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn completed_is_terminal() {
        for to in ALL {
            assert!(!is_valid_transition(Completed, to), "completed -> {to}");
        }
    }

    #[test]
    fn validate_reports_both_endpoints() {
        let err = validate(Completed, Running).unwrap_err();
        assert_eq!(err.from, Completed);
        assert_eq!(err.to, Running);
        assert!(err.to_string().contains("completed -> running"));
    }

    fn arb_status() -> impl Strategy<Value = NodeStatus> {
        prop::sample::select(ALL.to_vec())
    }

    proptest! {
        /// Random transition sequences: the tracked status only ever moves
        /// along legal edges, and rejected transitions leave it unchanged.
        #[test]
        fn random_sequences_never_escape_the_table(
            requested in prop::collection::vec(arb_status(), 1..64)
        ) {
            let mut current = Pending;
            for to in requested {
                match validate(current, to) {
                    Ok(()) => {
                        prop_assert!(LEGAL.contains(&(current, to)));
                        current = to;
                    }
                    Err(e) => {
                        prop_assert_eq!(e.from, current);
                        prop_assert_eq!(e.to, to);
                        // State unchanged on rejection.
                    }
                }
            }
        }
    }
}
