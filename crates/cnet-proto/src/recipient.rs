//! Addressing of protocol peers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a recipient address is resolved by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    /// A single addressable agent.
    Agent,
    /// A broadcast route: every agent interested in the protocol receives
    /// the message, and the number of repliers is unknown up front.
    Broadcast,
}

/// An addressable peer of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Routing key resolved by the transport.
    pub key: String,
    /// Point-to-point or broadcast.
    pub kind: RecipientKind,
}

impl Recipient {
    /// Address a single agent by key.
    #[must_use]
    pub fn agent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: RecipientKind::Agent,
        }
    }

    /// Address every agent listening on a broadcast route.
    #[must_use]
    pub fn broadcast(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: RecipientKind::Broadcast,
        }
    }

    /// Returns true for broadcast routes.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.kind, RecipientKind::Broadcast)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RecipientKind::Agent => write!(f, "{}", self.key),
            RecipientKind::Broadcast => write!(f, "*{}", self.key),
        }
    }
}
