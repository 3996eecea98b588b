//! The announcing role: drives one contract from `initiated` to a terminal
//! state against a pool of bidding contractors.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, warn};

use cnet_proto::{ContractMessage, MessageId, MessageKind, Recipient, SessionId};

use crate::channel::Channel;
use crate::dispatch::{dispatch, expect_kind, Rule};
use crate::error::ProtocolError;
use crate::expiration::{ExpirationScheduler, TimerId};
use crate::machine::StateMachine;
use crate::record::ContractorRecords;
use crate::runtime::{Listener, Runtime};
use crate::state::{ContractState, RecordState};

/// Business logic embedded in a [`Manager`].
///
/// Hooks default to no-ops; a hook failing forces the contract into `wtf`
/// and terminates it. Hooks receive the [`ManagerCore`] so they can drive
/// the lifecycle (announce from `initiate`, grant from `closed`, and so on).
pub trait ManagerPolicy: Send {
    /// Protocol this manager announces under.
    fn protocol_id(&self) -> &str;

    /// How long `initiate` may take before the contract is failed for never
    /// announcing.
    fn initiate_timeout(&self) -> Duration {
        Duration::seconds(10)
    }

    /// Length of the announce window.
    fn announce_timeout(&self) -> Duration {
        Duration::seconds(10)
    }

    /// How long granted contractors get before the contract is aborted.
    fn grant_timeout(&self) -> Duration {
        Duration::seconds(10)
    }

    /// Setup hook; normally composes and sends the announcement.
    fn initiate(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }

    /// A bid arrived (its record is already registered).
    fn bid(&mut self, core: &mut ManagerCore, bid: &ContractMessage) -> Result<(), ProtocolError> {
        let _ = (core, bid);
        Ok(())
    }

    /// The announce window closed with at least one bid collected.
    fn closed(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }

    /// The contract expired without a usable bid.
    fn expired(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }

    /// The contract was cancelled; `cancellation` is the peer's message
    /// when a contractor initiated it.
    fn cancelled(
        &mut self,
        core: &mut ManagerCore,
        cancellation: Option<&ContractMessage>,
    ) -> Result<(), ProtocolError> {
        let _ = (core, cancellation);
        Ok(())
    }

    /// Every granted contractor reported; `reports` holds their final
    /// reports.
    fn completed(
        &mut self,
        core: &mut ManagerCore,
        reports: &[ContractMessage],
    ) -> Result<(), ProtocolError> {
        let _ = (core, reports);
        Ok(())
    }

    /// The grant deadline elapsed before every report arrived.
    fn aborted(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }
}

/// Expiry tokens for the manager's single pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerExpiry {
    /// `initiate` never announced in time.
    InitiateTimeout,
    /// The announce window closed.
    AnnounceWindow,
    /// Every collected bid expired before a grant.
    BidsExpired,
    /// Granted contractors did not all report in time.
    GrantTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerHandler {
    Bid,
    Refusal,
    Report,
    Cancel,
}

const TABLE: &[Rule<ContractState, ManagerHandler>] = &[
    Rule {
        kind: MessageKind::Bid,
        before: &[ContractState::Announced],
        after: ContractState::Announced,
        handler: ManagerHandler::Bid,
    },
    Rule {
        kind: MessageKind::Refusal,
        before: &[ContractState::Announced],
        after: ContractState::Announced,
        handler: ManagerHandler::Refusal,
    },
    Rule {
        kind: MessageKind::FinalReport,
        before: &[ContractState::Granted],
        after: ContractState::Granted,
        handler: ManagerHandler::Report,
    },
    Rule {
        kind: MessageKind::Cancellation,
        before: &[ContractState::Granted],
        after: ContractState::Cancelled,
        handler: ManagerHandler::Cancel,
    },
];

/// Lifecycle mechanics of one managed contract.
///
/// Split out of [`Manager`] so policy hooks can borrow it mutably while the
/// policy itself is being called.
pub struct ManagerCore {
    machine: StateMachine<ContractState>,
    scheduler: ExpirationScheduler<ManagerExpiry>,
    channel: Channel,
    records: ContractorRecords,
    expected_bids: Option<usize>,
    announce_timeout: Duration,
    grant_timeout: Duration,
    terminated: bool,
}

impl ManagerCore {
    /// This contract's session id.
    pub fn session_id(&self) -> SessionId {
        self.channel.session_id()
    }

    /// Current contract state.
    pub fn state(&self) -> ContractState {
        self.machine.state()
    }

    /// The contractor records collected so far.
    pub fn records(&self) -> &ContractorRecords {
        &self.records
    }

    /// True once the contract has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Number of bids after which the announce window closes early, when
    /// every recipient was point-to-point.
    pub fn expected_bids(&self) -> Option<usize> {
        self.expected_bids
    }

    /// Send the announcement and open the announce window.
    ///
    /// Requires `initiated`. The announcement expires when the window
    /// closes; the window timer is armed for the same deadline.
    pub fn announce(&mut self, announce: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&announce, MessageKind::Announcement)?;
        self.machine.ensure(&[ContractState::Initiated])?;
        debug!(session = %self.session_id(), "announcing");
        self.machine.set(ContractState::Announced);

        let deadline = self.channel.now() + self.announce_timeout;
        let id = self.channel.send(announce, Some(deadline), None, None);

        self.scheduler.cancel();
        self.scheduler
            .schedule(self.channel.runtime(), deadline, ManagerExpiry::AnnounceWindow)?;
        Ok(id)
    }

    /// Reject the bid with message id `bid_id`, sending `rejection` (or a
    /// default one) to the bidder. Requires `announced`.
    pub fn reject(
        &mut self,
        bid_id: MessageId,
        rejection: Option<ContractMessage>,
    ) -> Result<(), ProtocolError> {
        self.machine.ensure(&[ContractState::Announced])?;
        let msg = match rejection {
            Some(msg) => {
                expect_kind(&msg, MessageKind::Rejection)?;
                msg
            }
            None => ContractMessage::rejection(),
        };
        let record = self.records.by_bid_id(bid_id).ok_or(ProtocolError::UnknownBid)?;
        record.on_event(msg, &self.channel);
        Ok(())
    }

    /// Grant one sub-bid per listed bid and auto-reject every other record
    /// still in state `bid`.
    ///
    /// Allowed from `closed` or, when granting before the window naturally
    /// closes, from `announced`. Arms the grant deadline; each grant is
    /// stamped to expire at that deadline.
    pub fn grant(
        &mut self,
        grants: Vec<(MessageId, ContractMessage)>,
    ) -> Result<(), ProtocolError> {
        self.machine
            .ensure(&[ContractState::Closed, ContractState::Announced])?;
        for (bid_id, grant) in &grants {
            expect_kind(grant, MessageKind::Grant)?;
            if self.records.by_bid_id(*bid_id).is_none() {
                return Err(ProtocolError::UnknownBid);
            }
        }

        self.scheduler.cancel();
        self.machine.set(ContractState::Granted);

        let deadline = self.channel.now() + self.grant_timeout;
        self.scheduler
            .schedule(self.channel.runtime(), deadline, ManagerExpiry::GrantTimeout)?;

        for (bid_id, grant) in grants {
            let grant = grant.with_expiration(deadline);
            if let Some(record) = self.records.by_bid_id(bid_id) {
                record.on_event(grant, &self.channel);
            }
        }
        // at most one grant per bid: everyone not granted is turned down
        for record in self.records.with_state_mut(&[RecordState::Bid]) {
            record.on_event(ContractMessage::rejection(), &self.channel);
        }
        Ok(())
    }

    /// Cancel mechanics: move to `cancelled` and notify every granted or
    /// completed contractor. The `cancelled` hook is invoked by
    /// [`Manager::cancel`], not here.
    fn cancel_records(&mut self, reason: Option<String>) -> Result<(), ProtocolError> {
        self.machine
            .ensure(&[ContractState::Granted, ContractState::Cancelled])?;
        self.machine.set(ContractState::Cancelled);
        self.scheduler.cancel();
        for record in self
            .records
            .with_state_mut(&[RecordState::Granted, RecordState::Completed])
        {
            record.on_event(ContractMessage::cancellation(reason.clone()), &self.channel);
        }
        Ok(())
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.scheduler.cancel();
        debug!(session = %self.session_id(), "unregistering manager");
        self.channel.unregister();
    }
}

/// The announcing role.
///
/// Composes the state machine, expiration scheduler, message envelope,
/// dispatch table and the contractor record collection; the embedded
/// [`ManagerPolicy`] supplies the business decisions.
pub struct Manager<P: ManagerPolicy> {
    core: ManagerCore,
    policy: P,
}

impl<P: ManagerPolicy> Manager<P> {
    /// A manager over `recipients`, bound to a fresh session id.
    ///
    /// When every recipient is point-to-point the announce window closes
    /// early once a record exists for each of them; a broadcast recipient
    /// means the number of bidders is unknown and only the window timer
    /// closes it.
    pub fn new(runtime: Arc<dyn Runtime>, recipients: Vec<Recipient>, policy: P) -> Self {
        let expected_bids = if recipients.iter().any(Recipient::is_broadcast) {
            None
        } else {
            Some(recipients.len())
        };
        let channel = Channel::new(runtime, policy.protocol_id().to_string(), recipients);
        let session = channel.session_id();
        let core = ManagerCore {
            machine: StateMachine::new(session, ContractState::Initiated),
            scheduler: ExpirationScheduler::new(session),
            channel,
            records: ContractorRecords::new(),
            expected_bids,
            announce_timeout: policy.announce_timeout(),
            grant_timeout: policy.grant_timeout(),
            terminated: false,
        };
        Self { core, policy }
    }

    /// This contract's session id.
    pub fn session_id(&self) -> SessionId {
        self.core.session_id()
    }

    /// Current contract state.
    pub fn state(&self) -> ContractState {
        self.core.state()
    }

    /// The lifecycle mechanics, for inspection.
    pub fn core(&self) -> &ManagerCore {
        &self.core
    }

    /// The embedded business logic.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Run the policy's setup hook, guarded by the initiate timeout: if the
    /// hook never announces and the timeout elapses, the contract is failed
    /// with a descriptive error.
    pub fn initiate(&mut self) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), protocol = %self.core.channel.protocol_id(), "initiating contract");
        self.core.machine.set(ContractState::Initiated);
        let deadline = self.core.channel.now() + self.policy.initiate_timeout();
        self.core.scheduler.schedule(
            self.core.channel.runtime(),
            deadline,
            ManagerExpiry::InitiateTimeout,
        )?;
        if let Err(err) = self.policy.initiate(&mut self.core) {
            self.fail("initiate hook failed", &err);
        }
        Ok(())
    }

    /// Send the announcement and open the announce window.
    pub fn announce(&mut self, announce: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.announce(announce)
    }

    /// Reject one bid. See [`ManagerCore::reject`].
    pub fn reject(
        &mut self,
        bid_id: MessageId,
        rejection: Option<ContractMessage>,
    ) -> Result<(), ProtocolError> {
        self.core.reject(bid_id, rejection)
    }

    /// Grant sub-bids. See [`ManagerCore::grant`].
    pub fn grant(
        &mut self,
        grants: Vec<(MessageId, ContractMessage)>,
    ) -> Result<(), ProtocolError> {
        self.core.grant(grants)
    }

    /// Cancel the contract: notify every granted or completed contractor,
    /// run the `cancelled` hook and terminate.
    pub fn cancel(&mut self, reason: Option<String>) -> Result<(), ProtocolError> {
        self.core.cancel_records(reason)?;
        let result = self.policy.cancelled(&mut self.core, None);
        self.run_then_terminate(result);
        Ok(())
    }

    fn on_bid(&mut self, bid: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), bid = %bid.message_id, "bid received");
        self.core
            .records
            .register(self.core.machine.session(), bid.clone(), RecordState::Bid)?;
        self.policy.bid(&mut self.core, &bid)?;
        if let Some(expected) = self.core.expected_bids {
            if self.core.records.len() >= expected
                && self.core.machine.is_in(&[ContractState::Announced])
            {
                debug!(session = %self.session_id(), expected, "all expected bids in, closing early");
                self.core.scheduler.cancel();
                self.close_announce_period()?;
            }
        }
        Ok(())
    }

    fn on_refusal(&mut self, refusal: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "refusal received");
        self.core
            .records
            .register(self.core.machine.session(), refusal, RecordState::Refused)?;
        Ok(())
    }

    fn on_report(&mut self, report: ContractMessage) -> Result<(), ProtocolError> {
        let Some(record) = self.core.records.by_reply(&report) else {
            warn!(session = %self.session_id(), "report from unknown contractor, ignoring");
            return Ok(());
        };
        record.on_event(report, &self.core.channel);
        if self.core.records.count_in(&[RecordState::Granted]) == 0 {
            self.on_complete()?;
        }
        Ok(())
    }

    fn on_cancel(&mut self, cancellation: ContractMessage) -> Result<(), ProtocolError> {
        if self.core.records.by_reply(&cancellation).is_none() {
            warn!(session = %self.session_id(), "cancellation from unknown contractor, ignoring");
            return Ok(());
        }
        let reason = match &cancellation.body {
            cnet_proto::MessageBody::Cancellation { reason } => reason.clone(),
            _ => None,
        };
        let reason = Some(format!(
            "contractor cancelled the job: {}",
            reason.unwrap_or_else(|| "no reason given".into())
        ));
        self.core.cancel_records(reason)?;
        let result = self.policy.cancelled(&mut self.core, Some(&cancellation));
        self.run_then_terminate(result);
        Ok(())
    }

    fn on_announce_expire(&mut self) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "announce window closed");
        self.core.machine.ensure(&[ContractState::Announced])?;
        if self.core.records.count_in(&[RecordState::Bid]) > 0 {
            self.close_announce_period()
        } else {
            self.core.machine.set(ContractState::Expired);
            let result = self.policy.expired(&mut self.core);
            self.run_then_terminate(result);
            Ok(())
        }
    }

    fn close_announce_period(&mut self) -> Result<(), ProtocolError> {
        self.core.machine.set(ContractState::Closed);
        let deadline = self
            .core
            .records
            .max_bid_expiration()
            .ok_or(ProtocolError::MissingExpiration)?;
        if deadline <= self.core.channel.now() {
            // every collected bid was already stale by the time the window closed
            self.core.machine.set(ContractState::Expired);
            let result = self.policy.expired(&mut self.core);
            self.run_then_terminate(result);
            return Ok(());
        }
        self.core.scheduler.schedule(
            self.core.channel.runtime(),
            deadline,
            ManagerExpiry::BidsExpired,
        )?;
        self.policy.closed(&mut self.core)
    }

    fn on_complete(&mut self) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "all reports received, acknowledging");
        self.core.machine.ensure(&[ContractState::Granted])?;
        self.core.machine.set(ContractState::Completed);
        self.core.scheduler.cancel();
        let mut reports = Vec::new();
        for record in self.core.records.with_state_mut(&[RecordState::Completed]) {
            if let Some(report) = record.report() {
                reports.push(report.clone());
            }
            record.on_event(ContractMessage::acknowledgement(), &self.core.channel);
        }
        let result = self.policy.completed(&mut self.core, &reports);
        self.run_then_terminate(result);
        Ok(())
    }

    /// Invoke a completion hook and tear the contract down regardless of
    /// the hook's outcome.
    fn run_then_terminate(&mut self, result: Result<(), ProtocolError>) {
        if let Err(err) = result {
            error!(session = %self.session_id(), error = %err, "completion hook failed");
            self.core.machine.set(ContractState::Wtf);
        }
        self.core.terminate();
    }

    /// The only path into `wtf`: log, force the state, terminate.
    fn fail(&mut self, context: &str, err: &ProtocolError) {
        error!(
            session = %self.session_id(),
            state = %self.state(),
            error = %err,
            "{context}; failing contract"
        );
        self.core.machine.set(ContractState::Wtf);
        self.core.terminate();
    }
}

impl<P: ManagerPolicy> Listener for Manager<P> {
    fn session_id(&self) -> SessionId {
        self.core.session_id()
    }

    fn on_message(&mut self, msg: ContractMessage) {
        if self.core.terminated {
            debug!(session = %self.session_id(), kind = %msg.kind(), "contract terminated, dropping message");
            return;
        }
        let kind = msg.kind();
        let Some(handler) = dispatch(&mut self.core.machine, TABLE, kind) else {
            return;
        };
        let result = match handler {
            ManagerHandler::Bid => self.on_bid(msg),
            ManagerHandler::Refusal => self.on_refusal(msg),
            ManagerHandler::Report => self.on_report(msg),
            ManagerHandler::Cancel => self.on_cancel(msg),
        };
        if let Err(err) = result {
            self.fail("message handler failed", &err);
        }
    }

    fn on_timer(&mut self, timer: TimerId) {
        if self.core.terminated {
            return;
        }
        let Some(expiry) = self.core.scheduler.take_fired(timer) else {
            return;
        };
        match expiry {
            ManagerExpiry::InitiateTimeout => {
                let err = ProtocolError::Policy(anyhow::anyhow!(
                    "timeout exceeded waiting for initiate() to send the announcement"
                ));
                self.fail("initiate timeout", &err);
            }
            ManagerExpiry::AnnounceWindow => {
                if let Err(err) = self.on_announce_expire() {
                    self.fail("announce window handling failed", &err);
                }
            }
            ManagerExpiry::BidsExpired => {
                self.core.machine.set(ContractState::Expired);
                let result = self.policy.expired(&mut self.core);
                self.run_then_terminate(result);
            }
            ManagerExpiry::GrantTimeout => {
                self.core.machine.set(ContractState::Aborted);
                let result = self.policy.aborted(&mut self.core);
                self.run_then_terminate(result);
            }
        }
    }
}
