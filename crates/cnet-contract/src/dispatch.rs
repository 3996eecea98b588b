//! Table-driven dispatch of inbound messages.

use std::fmt;
use tracing::{debug, warn};

use cnet_proto::{ContractMessage, MessageKind};

use crate::error::ProtocolError;
use crate::machine::StateMachine;

/// One dispatch rule: a message kind, the states it is legal in, the state
/// to transition to, and a role-specific handler token.
///
/// Tables are plain data built once per role; a kind may appear in several
/// rules with disjoint `before` sets (the contractor's cancellation handling
/// does this).
pub struct Rule<S: 'static, H> {
    /// Message kind this rule matches.
    pub kind: MessageKind,
    /// States the message is legal in.
    pub before: &'static [S],
    /// State after the transition (may equal the current state).
    pub after: S,
    /// Which handler the role should invoke.
    pub handler: H,
}

/// Validate and transition for an inbound message of `kind`.
///
/// Unknown kinds and wrong-state messages are logged and dropped (`None`),
/// never an error — this is what absorbs the race between a timer firing
/// and a message arriving. On a match the state is set first, then the
/// handler token is returned, so the handler always observes the
/// post-transition state.
pub fn dispatch<S, H>(
    machine: &mut StateMachine<S>,
    table: &[Rule<S, H>],
    kind: MessageKind,
) -> Option<H>
where
    S: Copy + PartialEq + fmt::Debug,
    H: Copy,
{
    let mut known = false;
    let mut matched: Option<&Rule<S, H>> = None;
    for rule in table.iter().filter(|r| r.kind == kind) {
        known = true;
        if machine.is_in(rule.before) {
            if matched.is_some() {
                warn!(
                    session = %machine.session(),
                    %kind,
                    state = ?machine.state(),
                    "ambiguous dispatch rules, dropping message"
                );
                return None;
            }
            matched = Some(rule);
        }
    }
    if !known {
        debug!(session = %machine.session(), %kind, "no handler for message kind, ignoring");
        return None;
    }
    let Some(rule) = matched else {
        warn!(
            session = %machine.session(),
            %kind,
            state = ?machine.state(),
            "message arrived in wrong state, dropping"
        );
        return None;
    };
    machine.set(rule.after);
    Some(rule.handler)
}

/// Guard for operations taking a caller-composed message of one fixed kind.
pub(crate) fn expect_kind(
    msg: &ContractMessage,
    expected: MessageKind,
) -> Result<(), ProtocolError> {
    if msg.kind() == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedKind {
            expected,
            actual: msg.kind(),
        })
    }
}
