//! Protocol message definitions.
//!
//! Every message carries the same stamped header fields (session ids,
//! protocol id, expiration) plus a discriminated body. Application payload
//! is opaque to the negotiation core and travels as raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::recipient::Recipient;
use crate::types::{MessageId, SessionId};

/// Discriminant of a [`MessageBody`], used to key dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Manager announces work to candidate contractors.
    Announcement,
    /// Contractor offers to take the work.
    Bid,
    /// Contractor declines to bid.
    Refusal,
    /// Manager accepts one sub-bid of a bid.
    Grant,
    /// Manager turns a bid down.
    Rejection,
    /// Either side calls the negotiation off.
    Cancellation,
    /// Contractor's periodic status update while granted.
    UpdateReport,
    /// Contractor's completion report.
    FinalReport,
    /// Manager confirms receipt of the final report.
    Acknowledgement,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Announcement => "announcement",
            Self::Bid => "bid",
            Self::Refusal => "refusal",
            Self::Grant => "grant",
            Self::Rejection => "rejection",
            Self::Cancellation => "cancellation",
            Self::UpdateReport => "update_report",
            Self::FinalReport => "final_report",
            Self::Acknowledgement => "acknowledgement",
        };
        write!(f, "{name}")
    }
}

/// The role-specific part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Manager announces work.
    Announcement,
    /// Contractor bids. A bid may contain several sub-bids; grants reference
    /// one of them by index.
    Bid {
        /// Ordered list of sub-bids, opaque to the core.
        bids: Vec<Value>,
    },
    /// Contractor declines to bid.
    Refusal,
    /// Manager accepts one specific sub-bid.
    Grant {
        /// Index into the granted bid's sub-bid list.
        bid_index: usize,
        /// When set, the contractor sends an `UpdateReport` this often.
        update_report_secs: Option<u32>,
    },
    /// Manager turns a bid down.
    Rejection,
    /// Either side calls the negotiation off.
    Cancellation {
        /// Why the sender cancelled.
        reason: Option<String>,
    },
    /// Periodic status update from a granted contractor.
    UpdateReport,
    /// Completion report from a granted contractor.
    FinalReport,
    /// Manager confirms the final report.
    Acknowledgement,
}

impl MessageBody {
    /// The discriminant of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Announcement => MessageKind::Announcement,
            Self::Bid { .. } => MessageKind::Bid,
            Self::Refusal => MessageKind::Refusal,
            Self::Grant { .. } => MessageKind::Grant,
            Self::Rejection => MessageKind::Rejection,
            Self::Cancellation { .. } => MessageKind::Cancellation,
            Self::UpdateReport => MessageKind::UpdateReport,
            Self::FinalReport => MessageKind::FinalReport,
            Self::Acknowledgement => MessageKind::Acknowledgement,
        }
    }
}

/// One protocol message: stamped header fields plus a discriminated body.
///
/// Header fields other than `message_id` start unset and are filled in by
/// the sending role's envelope (session ids, protocol id, expiration) and by
/// the transport (`reply_to`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMessage {
    /// Correlation handle for this exact message.
    pub message_id: MessageId,
    /// Session of the sending role.
    pub sender_id: Option<SessionId>,
    /// Session of the intended receiving role, when known.
    pub receiver_id: Option<SessionId>,
    /// Protocol the message belongs to.
    pub protocol_id: Option<String>,
    /// Address replies should be sent to; stamped by the transport.
    pub reply_to: Option<Recipient>,
    /// Moment after which the message is no longer meaningful.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Application payload, opaque to the core.
    pub payload: Value,
    /// Role-specific body.
    pub body: MessageBody,
}

impl ContractMessage {
    /// Create a message with a fresh id and no header stamps.
    #[must_use]
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: MessageId::new(),
            sender_id: None,
            receiver_id: None,
            protocol_id: None,
            reply_to: None,
            expiration_time: None,
            payload: Value::Null,
            body,
        }
    }

    /// The discriminant of this message's body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// An announcement.
    #[must_use]
    pub fn announcement() -> Self {
        Self::new(MessageBody::Announcement)
    }

    /// A bid over the given sub-bids.
    #[must_use]
    pub fn bid(bids: Vec<Value>) -> Self {
        Self::new(MessageBody::Bid { bids })
    }

    /// A refusal.
    #[must_use]
    pub fn refusal() -> Self {
        Self::new(MessageBody::Refusal)
    }

    /// A grant of the sub-bid at `bid_index`, optionally requesting periodic
    /// update reports.
    #[must_use]
    pub fn grant(bid_index: usize, update_report_secs: Option<u32>) -> Self {
        Self::new(MessageBody::Grant {
            bid_index,
            update_report_secs,
        })
    }

    /// A rejection.
    #[must_use]
    pub fn rejection() -> Self {
        Self::new(MessageBody::Rejection)
    }

    /// A cancellation carrying an optional reason.
    #[must_use]
    pub fn cancellation(reason: Option<String>) -> Self {
        Self::new(MessageBody::Cancellation { reason })
    }

    /// A periodic update report.
    #[must_use]
    pub fn update_report() -> Self {
        Self::new(MessageBody::UpdateReport)
    }

    /// A final report.
    #[must_use]
    pub fn final_report() -> Self {
        Self::new(MessageBody::FinalReport)
    }

    /// An acknowledgement.
    #[must_use]
    pub fn acknowledgement() -> Self {
        Self::new(MessageBody::Acknowledgement)
    }

    /// Attach an application payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set an explicit expiration, overriding the envelope default.
    #[must_use]
    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(at);
        self
    }

    /// True once `now` is past the message's expiration.
    ///
    /// A message without an expiration never expires.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|at| now >= at)
    }
}
