//! Single-value state machine with asserted transitions.

use std::fmt;
use tracing::debug;

use cnet_proto::SessionId;

use crate::error::ProtocolError;

/// Holds the current state of one contract (or one record) and enforces
/// that every transition passes through an assertion point.
///
/// `set` is idempotent; `ensure` fails with a recoverable
/// [`ProtocolError::StateAssertion`] carrying both the expected set and the
/// actual state. No application code transitions directly — everything
/// funnels through the dispatcher or a lifecycle method that calls `ensure`
/// first.
pub struct StateMachine<S> {
    session: SessionId,
    state: S,
}

impl<S: Copy + PartialEq + fmt::Debug> StateMachine<S> {
    /// A machine starting in `initial`.
    pub fn new(session: SessionId, initial: S) -> Self {
        Self {
            session,
            state: initial,
        }
    }

    /// The session this machine belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Transition to `next`. A no-op when already there, but still logged.
    pub fn set(&mut self, next: S) {
        if self.state == next {
            debug!(session = %self.session, state = ?next, "state unchanged");
            return;
        }
        debug!(session = %self.session, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    /// True when the current state is in `allowed`.
    pub fn is_in(&self, allowed: &[S]) -> bool {
        allowed.contains(&self.state)
    }

    /// Assert that the current state is in `allowed`.
    pub fn ensure(&self, allowed: &[S]) -> Result<(), ProtocolError> {
        if self.is_in(allowed) {
            return Ok(());
        }
        Err(ProtocolError::StateAssertion {
            expected: format!("{allowed:?}"),
            actual: format!("{:?}", self.state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ContractState;

    fn machine() -> StateMachine<ContractState> {
        StateMachine::new(SessionId::new(), ContractState::Initiated)
    }

    #[test]
    fn set_records_transition() {
        let mut m = machine();
        m.set(ContractState::Announced);
        assert_eq!(m.state(), ContractState::Announced);
    }

    #[test]
    fn set_is_idempotent() {
        let mut m = machine();
        m.set(ContractState::Initiated);
        assert_eq!(m.state(), ContractState::Initiated);
    }

    #[test]
    fn ensure_passes_for_member_state() {
        let m = machine();
        assert!(m
            .ensure(&[ContractState::Initiated, ContractState::Announced])
            .is_ok());
    }

    #[test]
    fn ensure_reports_expected_and_actual() {
        let m = machine();
        let err = m.ensure(&[ContractState::Granted]).unwrap_err();
        assert!(err.is_state_assertion());
        let text = err.to_string();
        assert!(text.contains("Granted"));
        assert!(text.contains("Initiated"));
    }
}
