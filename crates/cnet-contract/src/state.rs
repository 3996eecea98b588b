//! Contract and per-bid record states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one negotiation, as seen by either role.
///
/// One shared enum covers both roles; each role's dispatch table restricts
/// which states are reachable on its side. Manager-side flow:
/// `initiated → announced → {closed | expired}`, `closed → {granted |
/// expired}`, `granted → {completed | cancelled | aborted}`. Contractor-side
/// flow: `initiated → announced → {bid | refused | delegated | closed}`,
/// `bid → {granted | rejected | expired}`, `granted → {completed | cancelled
/// | defected}`, `completed → {acknowledged | aborted}`. `Wtf` is the
/// universal absorbing error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    /// Role created, nothing sent yet.
    Initiated,
    /// Announcement sent (manager) or received (contractor).
    Announced,
    /// Contractor declined to bid.
    Refused,
    /// Contractor's bid is out.
    Bid,
    /// Contractor handed its bid over to a nested contractor.
    Delegated,
    /// Manager rejected the contractor's bid.
    Rejected,
    /// Announce window closed with at least one bid collected.
    Closed,
    /// A bid was granted.
    Granted,
    /// A deadline elapsed with nothing more to wait for.
    Expired,
    /// Work finished and reported.
    Completed,
    /// Contractor walked away from granted work.
    Defected,
    /// Negotiation called off.
    Cancelled,
    /// Final report acknowledged.
    Acknowledged,
    /// Gave up waiting after a grant or a final report.
    Aborted,
    /// Unrecoverable fault; absorbing.
    Wtf,
}

impl ContractState {
    /// True for states from which no further transition happens.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Refused
                | Self::Delegated
                | Self::Rejected
                | Self::Expired
                | Self::Defected
                | Self::Cancelled
                | Self::Acknowledged
                | Self::Aborted
                | Self::Wtf
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Announced => "announced",
            Self::Refused => "refused",
            Self::Bid => "bid",
            Self::Delegated => "delegated",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
            Self::Granted => "granted",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::Defected => "defected",
            Self::Cancelled => "cancelled",
            Self::Acknowledged => "acknowledged",
            Self::Aborted => "aborted",
            Self::Wtf => "wtf",
        };
        write!(f, "{name}")
    }
}

/// State of one manager-side contractor record (one per received bid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Bid received, not yet resolved.
    Bid,
    /// The contractor refused to bid.
    Refused,
    /// The bid was rejected.
    Rejected,
    /// The bid was granted.
    Granted,
    /// Final report received.
    Completed,
    /// Cancellation sent to this contractor.
    Cancelled,
    /// Acknowledgement sent for the final report.
    Acknowledged,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bid => "bid",
            Self::Refused => "refused",
            Self::Rejected => "rejected",
            Self::Granted => "granted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Acknowledged => "acknowledged",
        };
        write!(f, "{name}")
    }
}
