//! Manager-side per-bid contractor records.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use cnet_proto::{ContractMessage, MessageId, MessageKind, Recipient, SessionId};

use crate::channel::Channel;
use crate::dispatch::{dispatch, Rule};
use crate::error::ProtocolError;
use crate::machine::StateMachine;
use crate::state::RecordState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordHandler {
    /// Forward the event message to the bidder.
    Forward,
    /// Keep the message (a final report) for the completion round.
    Retain,
}

const TABLE: &[Rule<RecordState, RecordHandler>] = &[
    Rule {
        kind: MessageKind::Rejection,
        before: &[RecordState::Bid],
        after: RecordState::Rejected,
        handler: RecordHandler::Forward,
    },
    Rule {
        kind: MessageKind::Grant,
        before: &[RecordState::Bid],
        after: RecordState::Granted,
        handler: RecordHandler::Forward,
    },
    Rule {
        kind: MessageKind::Cancellation,
        before: &[RecordState::Granted, RecordState::Completed],
        after: RecordState::Cancelled,
        handler: RecordHandler::Forward,
    },
    Rule {
        kind: MessageKind::Acknowledgement,
        before: &[RecordState::Completed],
        after: RecordState::Acknowledged,
        handler: RecordHandler::Forward,
    },
    Rule {
        kind: MessageKind::FinalReport,
        before: &[RecordState::Granted],
        after: RecordState::Completed,
        handler: RecordHandler::Retain,
    },
];

/// One received bid, from the manager's point of view.
///
/// Owns its own small state machine (`bid → refused/rejected/granted`, then
/// the granted flow `granted → completed → acknowledged` or `cancelled`).
/// Records persist for the life of the contract and are inspected by state;
/// they are only removed by an explicit [`ContractorRecords::remove`].
pub struct ContractorRecord {
    machine: StateMachine<RecordState>,
    bid: ContractMessage,
    reply_to: Recipient,
    remote_id: Option<SessionId>,
    report: Option<ContractMessage>,
}

impl ContractorRecord {
    fn new(
        session: SessionId,
        bid: ContractMessage,
        state: RecordState,
    ) -> Result<Self, ProtocolError> {
        let reply_to = bid.reply_to.clone().ok_or(ProtocolError::MissingReplyTo)?;
        Ok(Self {
            machine: StateMachine::new(session, state),
            remote_id: bid.sender_id,
            bid,
            reply_to,
            report: None,
        })
    }

    /// Current record state.
    pub fn state(&self) -> RecordState {
        self.machine.state()
    }

    /// The bid (or refusal) that created this record.
    pub fn bid(&self) -> &ContractMessage {
        &self.bid
    }

    /// The bidder's address.
    pub fn reply_to(&self) -> &Recipient {
        &self.reply_to
    }

    /// The retained final report, once received.
    pub fn report(&self) -> Option<&ContractMessage> {
        self.report.as_ref()
    }

    /// Run one event through the record's state machine.
    ///
    /// Grants, rejections, cancellations and acknowledgements are forwarded
    /// to the bidder through the owning manager's envelope; final reports
    /// are retained. Wrong-state events are logged and dropped by the
    /// dispatcher, exactly like contract-level messages.
    pub fn on_event(&mut self, msg: ContractMessage, channel: &Channel) -> Option<MessageId> {
        match dispatch(&mut self.machine, TABLE, msg.kind()) {
            Some(RecordHandler::Forward) => {
                debug!(
                    session = %self.machine.session(),
                    bidder = %self.reply_to,
                    kind = %msg.kind(),
                    "forwarding to bidder"
                );
                Some(channel.send(
                    msg,
                    None,
                    Some(std::slice::from_ref(&self.reply_to)),
                    self.remote_id,
                ))
            }
            Some(RecordHandler::Retain) => {
                self.report = Some(msg);
                None
            }
            None => None,
        }
    }
}

/// The manager's collection of contractor records, keyed by bidder address.
#[derive(Default)]
pub struct ContractorRecords {
    records: HashMap<String, ContractorRecord>,
}

impl ContractorRecords {
    /// An empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record for the bidder behind `msg`.
    ///
    /// One bid per contractor per contract: a second registration for the
    /// same bidder key is a hard error.
    pub fn register(
        &mut self,
        session: SessionId,
        msg: ContractMessage,
        state: RecordState,
    ) -> Result<&mut ContractorRecord, ProtocolError> {
        let record = ContractorRecord::new(session, msg, state)?;
        let key = record.reply_to.key.clone();
        if self.records.contains_key(&key) {
            return Err(ProtocolError::DuplicateBid(key));
        }
        Ok(self.records.entry(key).or_insert(record))
    }

    /// Number of records, in any state.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record exists yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records whose state is in `states`.
    pub fn count_in(&self, states: &[RecordState]) -> usize {
        self.records
            .values()
            .filter(|r| states.contains(&r.state()))
            .count()
    }

    /// All records whose state is in `states`.
    pub fn with_state(&self, states: &[RecordState]) -> Vec<&ContractorRecord> {
        self.records
            .values()
            .filter(|r| states.contains(&r.state()))
            .collect()
    }

    /// Mutable view of all records whose state is in `states`.
    pub fn with_state_mut(&mut self, states: &[RecordState]) -> Vec<&mut ContractorRecord> {
        self.records
            .values_mut()
            .filter(|r| states.contains(&r.state()))
            .collect()
    }

    /// The record whose bid has the given message id.
    pub fn by_bid_id(&mut self, id: MessageId) -> Option<&mut ContractorRecord> {
        self.records.values_mut().find(|r| r.bid.message_id == id)
    }

    /// The record for the sender of `msg`, matched by reply address.
    pub fn by_reply(&mut self, msg: &ContractMessage) -> Option<&mut ContractorRecord> {
        let key = msg.reply_to.as_ref().map(|r| r.key.as_str())?;
        self.records.get_mut(key)
    }

    /// The record registered under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&ContractorRecord> {
        self.records.get(key)
    }

    /// Remove the record registered under `key`. The protocol itself never
    /// calls this; records normally persist for the life of the contract.
    pub fn remove(&mut self, key: &str) -> Option<ContractorRecord> {
        self.records.remove(key)
    }

    /// Latest expiration among all registered bids.
    pub fn max_bid_expiration(&self) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter_map(|r| r.bid.expiration_time)
            .max()
    }
}
