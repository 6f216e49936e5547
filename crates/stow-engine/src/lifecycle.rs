//! Document lifecycle
//!
//! ```text
//! Unloaded -> RawLoaded -> Migrated -> GroupsMaterialized -> ValuesLoaded
//!                 ^                            ^                  |
//!                 +------------ reload --------+---- resize ------+
//! ```

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Where the working document is in the load sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    /// Nothing read yet
    Unloaded,
    /// Raw document read from storage
    RawLoaded,
    /// Upfixer chain applied
    Migrated,
    /// Dynamic groups recreated from recorded ids
    GroupsMaterialized,
    /// Cells populated; saves allowed
    ValuesLoaded,
}

impl DocumentState {
    /// Whether the state is terminal for the start-up sequence
    #[inline]
    #[must_use]
    pub fn is_loaded(self) -> bool {
        self == Self::ValuesLoaded
    }
}

/// Validate a lifecycle transition
///
/// # Errors
/// [`LifecycleError::IllegalTransition`] if `to` is not reachable from `from`.
pub fn validate_transition(from: DocumentState, to: DocumentState) -> Result<(), LifecycleError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(LifecycleError::IllegalTransition { from, to })
    }
}

/// States reachable in one step
#[must_use]
pub fn allowed_transitions(from: DocumentState) -> Vec<DocumentState> {
    use DocumentState::{GroupsMaterialized, Migrated, RawLoaded, Unloaded, ValuesLoaded};
    match from {
        Unloaded => vec![RawLoaded],
        RawLoaded => vec![Migrated],
        Migrated => vec![GroupsMaterialized],
        GroupsMaterialized => vec![ValuesLoaded],
        // reload re-reads from disk, resize re-materializes in place
        ValuesLoaded => vec![RawLoaded, GroupsMaterialized],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use DocumentState::*;

    fn state_strategy() -> impl Strategy<Value = DocumentState> {
        prop_oneof![
            Just(Unloaded),
            Just(RawLoaded),
            Just(Migrated),
            Just(GroupsMaterialized),
            Just(ValuesLoaded),
        ]
    }

    #[test]
    fn start_up_sequence_is_legal() {
        let sequence = [Unloaded, RawLoaded, Migrated, GroupsMaterialized, ValuesLoaded];
        for pair in sequence.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn values_cannot_load_before_groups() {
        assert_eq!(
            validate_transition(Migrated, ValuesLoaded),
            Err(LifecycleError::IllegalTransition {
                from: Migrated,
                to: ValuesLoaded
            })
        );
        assert!(validate_transition(RawLoaded, GroupsMaterialized).is_err());
    }

    #[test]
    fn loaded_document_can_reload_or_resize() {
        assert!(validate_transition(ValuesLoaded, RawLoaded).is_ok());
        assert!(validate_transition(ValuesLoaded, GroupsMaterialized).is_ok());
        assert!(validate_transition(ValuesLoaded, Migrated).is_err());
    }

    proptest! {
        #[test]
        fn validate_agrees_with_table(from in state_strategy(), to in state_strategy()) {
            let allowed = allowed_transitions(from).contains(&to);
            prop_assert_eq!(validate_transition(from, to).is_ok(), allowed);
        }

        #[test]
        fn no_self_transitions(state in state_strategy()) {
            prop_assert!(validate_transition(state, state).is_err());
        }
    }
}
