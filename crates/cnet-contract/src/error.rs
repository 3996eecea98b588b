//! Error types for the negotiation core.

use chrono::{DateTime, Utc};
use thiserror::Error;

use cnet_proto::MessageKind;

/// Errors raised by the negotiation core.
///
/// State assertions are recoverable at the dispatch boundary (a message in
/// the wrong state is logged and dropped); everything else that reaches a
/// handler's error path forces the contract into `wtf` and terminates it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The contract was not in a state the operation allows.
    #[error("expected state in {expected}, was {actual}")]
    StateAssertion {
        /// States the operation allows, rendered for logging.
        expected: String,
        /// State the contract was actually in.
        actual: String,
    },

    /// A deadline handed to the scheduler had already passed. This is a
    /// sequencing bug in the caller, not a normal timeout.
    #[error("deadline {deadline} is already in the past (now {now})")]
    DeadlineInPast {
        /// The requested deadline.
        deadline: DateTime<Utc>,
        /// The clock at the time of the call.
        now: DateTime<Utc>,
    },

    /// A timer was armed while another was still pending; the old timer
    /// must be cancelled first.
    #[error("an expiration timer is already armed for this contract")]
    TimerAlreadyArmed,

    /// A second bid arrived from a bidder that already has a live record.
    #[error("a bid from {0} is already registered")]
    DuplicateBid(String),

    /// A grant or rejection referenced a bid with no record.
    #[error("no contractor record for the referenced bid")]
    UnknownBid,

    /// A grant referenced a sub-bid index the contractor never submitted.
    #[error("grant references bid index {index} but only {bids} sub-bids were submitted")]
    InvalidBidIndex {
        /// Index the grant carried.
        index: usize,
        /// Number of sub-bids actually submitted.
        bids: usize,
    },

    /// A lifecycle method was handed the wrong kind of message.
    #[error("expected a {expected} message, got {actual}")]
    UnexpectedKind {
        /// Kind the operation requires.
        expected: MessageKind,
        /// Kind that was passed.
        actual: MessageKind,
    },

    /// A message that must carry an expiration time did not.
    #[error("message carries no expiration time")]
    MissingExpiration,

    /// A message that must carry a reply address did not.
    #[error("message carries no reply address")]
    MissingReplyTo,

    /// An embedding business-logic hook failed.
    #[error(transparent)]
    Policy(#[from] anyhow::Error),
}

impl ProtocolError {
    /// True for the recoverable wrong-state assertion.
    #[must_use]
    pub const fn is_state_assertion(&self) -> bool {
        matches!(self, Self::StateAssertion { .. })
    }
}
