//! The bidding role: answers one announcement and, when granted, carries
//! the work through to an acknowledged report.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error};

use cnet_proto::{ContractMessage, MessageBody, MessageId, MessageKind, SessionId};

use crate::channel::Channel;
use crate::dispatch::{dispatch, expect_kind, Rule};
use crate::error::ProtocolError;
use crate::expiration::{ExpirationScheduler, TimerId};
use crate::machine::StateMachine;
use crate::reporter::Reporter;
use crate::runtime::{Listener, Runtime};
use crate::state::ContractState;

/// Business logic embedded in a [`Contractor`].
///
/// As on the manager side, hooks default to no-ops and a failing hook
/// forces `wtf` and terminates the contract.
pub trait ContractorPolicy: Send {
    /// Lifetime granted to our own bid, and to the final report while it
    /// waits for an acknowledgement.
    fn bid_timeout(&self) -> Duration {
        Duration::seconds(10)
    }

    /// The announcement arrived; normally bids, refuses or hands over.
    fn announced(
        &mut self,
        core: &mut ContractorCore,
        announcement: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        let _ = (core, announcement);
        Ok(())
    }

    /// The announcement expired before we responded.
    fn announce_expired(&mut self, core: &mut ContractorCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }

    /// Our bid expired without a grant or rejection.
    fn bid_expired(&mut self, core: &mut ContractorCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }

    /// The manager turned our bid down.
    fn rejected(
        &mut self,
        core: &mut ContractorCore,
        rejection: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        let _ = (core, rejection);
        Ok(())
    }

    /// The manager granted one of our sub-bids; the work starts here.
    fn granted(
        &mut self,
        core: &mut ContractorCore,
        grant: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        let _ = (core, grant);
        Ok(())
    }

    /// The manager cancelled the granted work.
    fn cancelled(
        &mut self,
        core: &mut ContractorCore,
        cancellation: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        let _ = (core, cancellation);
        Ok(())
    }

    /// The manager acknowledged our final report; the contract is done.
    fn acknowledged(
        &mut self,
        core: &mut ContractorCore,
        ack: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        let _ = (core, ack);
        Ok(())
    }

    /// The contract fell apart after completion or the report was never
    /// acknowledged.
    fn aborted(&mut self, core: &mut ContractorCore) -> Result<(), ProtocolError> {
        let _ = core;
        Ok(())
    }
}

/// Expiry tokens for the contractor's single pending deadline timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractorExpiry {
    /// The announcement expired before we bid or refused.
    AnnounceExpired,
    /// Our bid expired without an answer.
    BidExpired,
    /// The final report was never acknowledged.
    AckExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractorHandler {
    Announce,
    Reject,
    Grant,
    CancelGranted,
    CancelCompleted,
    Ack,
}

const TABLE: &[Rule<ContractState, ContractorHandler>] = &[
    Rule {
        kind: MessageKind::Announcement,
        before: &[ContractState::Initiated],
        after: ContractState::Announced,
        handler: ContractorHandler::Announce,
    },
    Rule {
        kind: MessageKind::Rejection,
        before: &[ContractState::Bid],
        after: ContractState::Rejected,
        handler: ContractorHandler::Reject,
    },
    Rule {
        kind: MessageKind::Grant,
        before: &[ContractState::Bid],
        after: ContractState::Granted,
        handler: ContractorHandler::Grant,
    },
    Rule {
        kind: MessageKind::Cancellation,
        before: &[ContractState::Granted],
        after: ContractState::Cancelled,
        handler: ContractorHandler::CancelGranted,
    },
    Rule {
        kind: MessageKind::Cancellation,
        before: &[ContractState::Completed],
        after: ContractState::Aborted,
        handler: ContractorHandler::CancelCompleted,
    },
    Rule {
        kind: MessageKind::Acknowledgement,
        before: &[ContractState::Completed],
        after: ContractState::Acknowledged,
        handler: ContractorHandler::Ack,
    },
];

/// Lifecycle mechanics of one contractor-side contract.
pub struct ContractorCore {
    machine: StateMachine<ContractState>,
    scheduler: ExpirationScheduler<ContractorExpiry>,
    channel: Channel,
    reporter: Reporter,
    announcement: ContractMessage,
    /// Sub-bid count of the bid we submitted, for grant validation.
    submitted_bids: usize,
    bid_timeout: Duration,
    terminated: bool,
}

impl ContractorCore {
    /// This contract's session id.
    pub fn session_id(&self) -> SessionId {
        self.channel.session_id()
    }

    /// Current contract state.
    pub fn state(&self) -> ContractState {
        self.machine.state()
    }

    /// The announcement this contractor answers.
    pub fn announcement(&self) -> &ContractMessage {
        &self.announcement
    }

    /// True once the contract has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True while the periodic update reporter is armed.
    pub fn is_reporting(&self) -> bool {
        self.reporter.is_armed()
    }

    /// Submit a bid. Requires `announced`; the bid gets a fresh
    /// `now + bid_timeout` expiration and a timer expires the contract if
    /// no grant or rejection arrives by then.
    pub fn bid(&mut self, bid: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&bid, MessageKind::Bid)?;
        self.machine.ensure(&[ContractState::Announced])?;
        self.machine.set(ContractState::Bid);
        self.scheduler.cancel();

        if let MessageBody::Bid { bids } = &bid.body {
            self.submitted_bids = bids.len();
        }
        let deadline = self.channel.now() + self.bid_timeout;
        let id = self
            .channel
            .send(bid.with_expiration(deadline), None, None, None);
        self.scheduler.schedule(
            self.channel.runtime(),
            deadline,
            ContractorExpiry::BidExpired,
        )?;
        Ok(id)
    }

    /// Decline the announcement and terminate. Requires `announced`.
    pub fn refuse(&mut self, refusal: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&refusal, MessageKind::Refusal)?;
        self.machine.ensure(&[ContractState::Announced])?;
        self.machine.set(ContractState::Refused);
        self.scheduler.cancel();
        let id = self.channel.send(refusal, None, None, None);
        self.terminate();
        Ok(id)
    }

    /// Forward a bid composed by a nested contractor and terminate this
    /// one; the nested contractor takes the negotiation over. Requires
    /// `announced`.
    pub fn handover(&mut self, bid: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&bid, MessageKind::Bid)?;
        self.machine.ensure(&[ContractState::Announced])?;
        self.machine.set(ContractState::Delegated);
        self.scheduler.cancel();
        let id = self.channel.handover(bid);
        self.terminate();
        Ok(id)
    }

    /// Send an interim status report. Requires `granted`; no transition.
    pub fn update(&mut self, report: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&report, MessageKind::UpdateReport)?;
        self.machine.ensure(&[ContractState::Granted])?;
        Ok(self.channel.send(report, None, None, None))
    }

    /// Cooperatively cancel the granted work and terminate.
    pub fn cancel(&mut self, cancellation: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.quit(cancellation, ContractState::Cancelled)
    }

    /// Walk away from the granted work and terminate. Same wire traffic as
    /// [`cancel`](Self::cancel), but the contract ends in `defected` so the
    /// owner can tell a cooperative cancel from a unilateral one.
    pub fn defect(&mut self, cancellation: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.quit(cancellation, ContractState::Defected)
    }

    fn quit(
        &mut self,
        cancellation: ContractMessage,
        end: ContractState,
    ) -> Result<MessageId, ProtocolError> {
        expect_kind(&cancellation, MessageKind::Cancellation)?;
        self.machine.ensure(&[ContractState::Granted])?;
        self.machine.set(end);
        self.scheduler.cancel();
        self.reporter.stop();
        let id = self.channel.send(cancellation, None, None, None);
        self.terminate();
        Ok(id)
    }

    /// Send the final report. Requires `granted`; the report gets a fresh
    /// `now + bid_timeout` expiration and the contract is aborted if no
    /// acknowledgement arrives by then.
    pub fn finalize(&mut self, report: ContractMessage) -> Result<MessageId, ProtocolError> {
        expect_kind(&report, MessageKind::FinalReport)?;
        self.machine.ensure(&[ContractState::Granted])?;
        self.machine.set(ContractState::Completed);
        self.scheduler.cancel();
        self.reporter.stop();
        let deadline = self.channel.now() + self.bid_timeout;
        let id = self
            .channel
            .send(report.with_expiration(deadline), None, None, None);
        self.scheduler.schedule(
            self.channel.runtime(),
            deadline,
            ContractorExpiry::AckExpired,
        )?;
        Ok(id)
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.scheduler.cancel();
        self.reporter.stop();
        debug!(session = %self.session_id(), "unregistering contractor");
        self.channel.unregister();
    }
}

/// The bidding role, built from the announcement that spawned it.
pub struct Contractor<P: ContractorPolicy> {
    core: ContractorCore,
    policy: P,
}

impl<P: ContractorPolicy> Contractor<P> {
    /// A contractor answering `announcement`.
    ///
    /// The reply channel is taken from the announcement's reply address and
    /// sender session; an announcement without a reply address cannot be
    /// negotiated with and is an error. The announcement itself is then
    /// delivered through [`Listener::on_message`] like any other message.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        announcement: ContractMessage,
        policy: P,
    ) -> Result<Self, ProtocolError> {
        expect_kind(&announcement, MessageKind::Announcement)?;
        let reply_to = announcement
            .reply_to
            .clone()
            .ok_or(ProtocolError::MissingReplyTo)?;
        let protocol_id = announcement.protocol_id.clone().unwrap_or_default();
        let channel = Channel::for_remote(
            runtime,
            protocol_id,
            announcement.sender_id,
            vec![reply_to],
        );
        let session = channel.session_id();
        let core = ContractorCore {
            machine: StateMachine::new(session, ContractState::Initiated),
            scheduler: ExpirationScheduler::new(session),
            reporter: Reporter::new(session),
            channel,
            announcement,
            submitted_bids: 0,
            bid_timeout: policy.bid_timeout(),
            terminated: false,
        };
        Ok(Self { core, policy })
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
    pub fn core(&self) -> &ContractorCore {
        &self.core
    }

    /// The embedded business logic.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Submit a bid. See [`ContractorCore::bid`].
    pub fn bid(&mut self, bid: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.bid(bid)
    }

    /// Decline the announcement. See [`ContractorCore::refuse`].
    pub fn refuse(&mut self, refusal: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.refuse(refusal)
    }

    /// Delegate to a nested contractor. See [`ContractorCore::handover`].
    pub fn handover(&mut self, bid: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.handover(bid)
    }

    /// Send an interim status report. See [`ContractorCore::update`].
    pub fn update(&mut self, report: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.update(report)
    }

    /// Cooperatively cancel the granted work. See [`ContractorCore::cancel`].
    pub fn cancel(&mut self, cancellation: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.cancel(cancellation)
    }

    /// Walk away from the granted work. See [`ContractorCore::defect`].
    pub fn defect(&mut self, cancellation: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.defect(cancellation)
    }

    /// Send the final report. See [`ContractorCore::finalize`].
    pub fn finalize(&mut self, report: ContractMessage) -> Result<MessageId, ProtocolError> {
        self.core.finalize(report)
    }

    fn on_announce(&mut self, announcement: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "announcement received");
        let deadline = announcement
            .expiration_time
            .ok_or(ProtocolError::MissingExpiration)?;
        self.core.scheduler.schedule(
            self.core.channel.runtime(),
            deadline,
            ContractorExpiry::AnnounceExpired,
        )?;
        self.core.announcement = announcement;
        let announcement = self.core.announcement.clone();
        self.policy.announced(&mut self.core, &announcement)
    }

    fn on_grant(&mut self, grant: ContractMessage) -> Result<(), ProtocolError> {
        let MessageBody::Grant {
            bid_index,
            update_report_secs,
        } = &grant.body
        else {
            return Err(ProtocolError::UnexpectedKind {
                expected: MessageKind::Grant,
                actual: grant.kind(),
            });
        };
        let (bid_index, update_report_secs) = (*bid_index, *update_report_secs);
        if bid_index >= self.core.submitted_bids {
            return Err(ProtocolError::InvalidBidIndex {
                index: bid_index,
                bids: self.core.submitted_bids,
            });
        }
        debug!(session = %self.session_id(), bid_index, "bid granted");
        self.core.scheduler.cancel();
        self.policy.granted(&mut self.core, &grant)?;
        if let Some(secs) = update_report_secs {
            self.core.reporter.start(
                self.core.channel.runtime(),
                std::time::Duration::from_secs(u64::from(secs)),
            );
        }
        Ok(())
    }

    fn on_reject(&mut self, rejection: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "bid rejected");
        self.core.scheduler.cancel();
        let result = self.policy.rejected(&mut self.core, &rejection);
        self.run_then_terminate(result);
        Ok(())
    }

    fn on_cancel_granted(&mut self, cancellation: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "granted work cancelled by manager");
        self.core.scheduler.cancel();
        self.core.reporter.stop();
        let result = self.policy.cancelled(&mut self.core, &cancellation);
        self.run_then_terminate(result);
        Ok(())
    }

    fn on_cancel_completed(&mut self) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "completed work cancelled, aborting");
        self.core.scheduler.cancel();
        let result = self.policy.aborted(&mut self.core);
        self.run_then_terminate(result);
        Ok(())
    }

    fn on_ack(&mut self, ack: ContractMessage) -> Result<(), ProtocolError> {
        debug!(session = %self.session_id(), "final report acknowledged");
        self.core.scheduler.cancel();
        let result = self.policy.acknowledged(&mut self.core, &ack);
        self.run_then_terminate(result);
        Ok(())
    }

    fn run_then_terminate(&mut self, result: Result<(), ProtocolError>) {
        if let Err(err) = result {
            error!(session = %self.session_id(), error = %err, "completion hook failed");
            self.core.machine.set(ContractState::Wtf);
        }
        self.core.terminate();
    }

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

impl<P: ContractorPolicy> Listener for Contractor<P> {
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
            ContractorHandler::Announce => self.on_announce(msg),
            ContractorHandler::Reject => self.on_reject(msg),
            ContractorHandler::Grant => self.on_grant(msg),
            ContractorHandler::CancelGranted => self.on_cancel_granted(msg),
            ContractorHandler::CancelCompleted => self.on_cancel_completed(),
            ContractorHandler::Ack => self.on_ack(msg),
        };
        if let Err(err) = result {
            self.fail("message handler failed", &err);
        }
    }

    fn on_timer(&mut self, timer: TimerId) {
        if self.core.terminated {
            return;
        }
        if self.core.reporter.take_fired(timer) {
            // reporter stops silently once the grant is over
            if self.core.machine.is_in(&[ContractState::Granted]) {
                self.core
                    .channel
                    .send(ContractMessage::update_report(), None, None, None);
                self.core.reporter.rearm(self.core.channel.runtime());
            } else {
                self.core.reporter.stop();
            }
            return;
        }
        let Some(expiry) = self.core.scheduler.take_fired(timer) else {
            return;
        };
        match expiry {
            ContractorExpiry::AnnounceExpired => {
                self.core.machine.set(ContractState::Closed);
                let result = self.policy.announce_expired(&mut self.core);
                self.run_then_terminate(result);
            }
            ContractorExpiry::BidExpired => {
                self.core.machine.set(ContractState::Expired);
                let result = self.policy.bid_expired(&mut self.core);
                self.run_then_terminate(result);
            }
            ContractorExpiry::AckExpired => {
                self.core.machine.set(ContractState::Aborted);
                let result = self.policy.aborted(&mut self.core);
                self.run_then_terminate(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::EmuRuntime;
    use cnet_proto::Recipient;
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestPolicy {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ContractorPolicy for TestPolicy {
        fn announced(
            &mut self,
            _core: &mut ContractorCore,
            _announcement: &ContractMessage,
        ) -> Result<(), ProtocolError> {
            self.events.lock().push("announced".into());
            Ok(())
        }

        fn announce_expired(&mut self, _core: &mut ContractorCore) -> Result<(), ProtocolError> {
            self.events.lock().push("announce_expired".into());
            Ok(())
        }

        fn bid_expired(&mut self, _core: &mut ContractorCore) -> Result<(), ProtocolError> {
            self.events.lock().push("bid_expired".into());
            Ok(())
        }

        fn rejected(
            &mut self,
            _core: &mut ContractorCore,
            _rejection: &ContractMessage,
        ) -> Result<(), ProtocolError> {
            self.events.lock().push("rejected".into());
            Ok(())
        }

        fn granted(
            &mut self,
            _core: &mut ContractorCore,
            _grant: &ContractMessage,
        ) -> Result<(), ProtocolError> {
            self.events.lock().push("granted".into());
            Ok(())
        }

        fn cancelled(
            &mut self,
            _core: &mut ContractorCore,
            _cancellation: &ContractMessage,
        ) -> Result<(), ProtocolError> {
            self.events.lock().push("cancelled".into());
            Ok(())
        }

        fn acknowledged(
            &mut self,
            _core: &mut ContractorCore,
            _ack: &ContractMessage,
        ) -> Result<(), ProtocolError> {
            self.events.lock().push("acknowledged".into());
            Ok(())
        }

        fn aborted(&mut self, _core: &mut ContractorCore) -> Result<(), ProtocolError> {
            self.events.lock().push("aborted".into());
            Ok(())
        }
    }

    type SharedContractor = Arc<Mutex<Contractor<TestPolicy>>>;

    fn announcement(runtime: &EmuRuntime) -> ContractMessage {
        let mut msg = ContractMessage::announcement();
        msg.sender_id = Some(SessionId::new());
        msg.protocol_id = Some("shard-backup".into());
        msg.reply_to = Some(Recipient::agent("mgr"));
        msg.expiration_time = Some(runtime.now() + Duration::seconds(10));
        msg
    }

    fn announced_contractor(
        runtime: &EmuRuntime,
    ) -> (SharedContractor, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let policy = TestPolicy {
            events: Arc::clone(&events),
        };
        let msg = announcement(runtime);
        let contractor = Arc::new(Mutex::new(
            Contractor::new(runtime.handle(), msg.clone(), policy).unwrap(),
        ));
        runtime.register_shared("w1", &contractor);
        contractor.lock().on_message(msg);
        (contractor, events)
    }

    fn granted_contractor(
        runtime: &EmuRuntime,
        update_secs: Option<u32>,
    ) -> (SharedContractor, Arc<Mutex<Vec<String>>>) {
        let (contractor, events) = announced_contractor(runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1), json!(2)]))
            .unwrap();
        contractor
            .lock()
            .on_message(ContractMessage::grant(1, update_secs));
        assert_eq!(contractor.lock().state(), ContractState::Granted);
        (contractor, events)
    }

    fn updates_sent(runtime: &EmuRuntime) -> usize {
        runtime
            .sent()
            .iter()
            .filter(|m| m.kind() == MessageKind::UpdateReport)
            .count()
    }

    #[test]
    fn announcement_without_reply_address_is_rejected() {
        let runtime = EmuRuntime::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut msg = ContractMessage::announcement();
        msg.expiration_time = Some(runtime.now() + Duration::seconds(10));
        let err = Contractor::new(runtime.handle(), msg, TestPolicy { events }).err();
        assert!(matches!(err, Some(ProtocolError::MissingReplyTo)));
    }

    #[test]
    fn announcement_arrival_runs_the_hook() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = announced_contractor(&runtime);
        assert_eq!(contractor.lock().state(), ContractState::Announced);
        assert_eq!(*events.lock(), vec!["announced"]);
    }

    #[test]
    fn unanswered_announcement_expires_the_contract() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = announced_contractor(&runtime);
        runtime.advance(Duration::seconds(11));
        assert_eq!(contractor.lock().state(), ContractState::Closed);
        assert!(events.lock().contains(&"announce_expired".to_string()));
        assert!(contractor.lock().core().is_terminated());
    }

    #[test]
    fn bid_gets_a_fresh_expiration_and_reaches_the_manager() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = announced_contractor(&runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1)]))
            .unwrap();
        assert_eq!(contractor.lock().state(), ContractState::Bid);
        let out = runtime.outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.kind(), MessageKind::Bid);
        assert_eq!(out[0].recipients, [Recipient::agent("mgr")]);
        assert_eq!(
            out[0].message.expiration_time,
            Some(runtime.now() + Duration::seconds(10))
        );
    }

    #[test]
    fn unanswered_bid_expires_the_contract() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = announced_contractor(&runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1)]))
            .unwrap();
        runtime.advance(Duration::seconds(11));
        assert_eq!(contractor.lock().state(), ContractState::Expired);
        assert!(events.lock().contains(&"bid_expired".to_string()));
        assert!(contractor.lock().core().is_terminated());
    }

    #[test]
    fn refusal_sends_and_terminates() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = announced_contractor(&runtime);
        contractor.lock().refuse(ContractMessage::refusal()).unwrap();
        assert_eq!(contractor.lock().state(), ContractState::Refused);
        assert!(contractor.lock().core().is_terminated());
        assert_eq!(runtime.sent()[0].kind(), MessageKind::Refusal);
    }

    #[test]
    fn handover_delegates_and_terminates() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = announced_contractor(&runtime);
        let mut bid = ContractMessage::bid(vec![json!(1)]);
        bid.reply_to = Some(Recipient::agent("nested"));
        contractor.lock().handover(bid).unwrap();
        assert_eq!(contractor.lock().state(), ContractState::Delegated);
        assert!(contractor.lock().core().is_terminated());
        let out = runtime.outbound();
        assert!(out[0].handover);
        assert_eq!(out[0].message.reply_to, Some(Recipient::agent("nested")));
    }

    #[test]
    fn bidding_twice_is_a_state_error() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = announced_contractor(&runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1)]))
            .unwrap();
        let err = contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(2)]))
            .unwrap_err();
        assert!(err.is_state_assertion());
    }

    #[test]
    fn rejection_runs_hook_and_terminates() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = announced_contractor(&runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1)]))
            .unwrap();
        contractor.lock().on_message(ContractMessage::rejection());
        assert_eq!(contractor.lock().state(), ContractState::Rejected);
        assert!(events.lock().contains(&"rejected".to_string()));
        assert!(contractor.lock().core().is_terminated());
    }

    #[test]
    fn grant_of_a_submitted_sub_bid_runs_the_hook() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = granted_contractor(&runtime, None);
        assert!(events.lock().contains(&"granted".to_string()));
        assert!(!contractor.lock().core().is_reporting());
    }

    #[test]
    fn grant_of_an_unknown_sub_bid_is_a_protocol_violation() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = announced_contractor(&runtime);
        contractor
            .lock()
            .bid(ContractMessage::bid(vec![json!(1)]))
            .unwrap();
        contractor.lock().on_message(ContractMessage::grant(3, None));
        assert_eq!(contractor.lock().state(), ContractState::Wtf);
        assert!(contractor.lock().core().is_terminated());
    }

    #[test]
    fn requested_updates_are_sent_periodically() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = granted_contractor(&runtime, Some(5));
        assert!(contractor.lock().core().is_reporting());
        runtime.advance(Duration::seconds(12));
        assert_eq!(updates_sent(&runtime), 2);
        assert!(contractor.lock().core().is_reporting());
    }

    #[test]
    fn cancellation_stops_the_reporter() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = granted_contractor(&runtime, Some(5));
        contractor
            .lock()
            .on_message(ContractMessage::cancellation(Some("plans changed".into())));
        assert_eq!(contractor.lock().state(), ContractState::Cancelled);
        assert!(events.lock().contains(&"cancelled".to_string()));
        assert!(contractor.lock().core().is_terminated());
        runtime.advance(Duration::seconds(30));
        assert_eq!(updates_sent(&runtime), 0);
    }

    #[test]
    fn cooperative_cancel_and_defection_end_differently() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = granted_contractor(&runtime, None);
        contractor
            .lock()
            .cancel(ContractMessage::cancellation(None))
            .unwrap();
        assert_eq!(contractor.lock().state(), ContractState::Cancelled);

        let (defector, _) = granted_contractor(&runtime, None);
        defector
            .lock()
            .defect(ContractMessage::cancellation(Some("found better work".into())))
            .unwrap();
        assert_eq!(defector.lock().state(), ContractState::Defected);
        assert!(runtime
            .sent()
            .iter()
            .filter(|m| m.kind() == MessageKind::Cancellation)
            .count() == 2);
    }

    #[test]
    fn finalize_then_acknowledgement_closes_the_contract() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = granted_contractor(&runtime, None);
        contractor
            .lock()
            .finalize(ContractMessage::final_report())
            .unwrap();
        assert_eq!(contractor.lock().state(), ContractState::Completed);
        contractor
            .lock()
            .on_message(ContractMessage::acknowledgement());
        assert_eq!(contractor.lock().state(), ContractState::Acknowledged);
        assert!(events.lock().contains(&"acknowledged".to_string()));
        assert!(contractor.lock().core().is_terminated());
    }

    #[test]
    fn unacknowledged_report_aborts_the_contract() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = granted_contractor(&runtime, None);
        contractor
            .lock()
            .finalize(ContractMessage::final_report())
            .unwrap();
        runtime.advance(Duration::seconds(11));
        assert_eq!(contractor.lock().state(), ContractState::Aborted);
        assert!(events.lock().contains(&"aborted".to_string()));
    }

    #[test]
    fn cancellation_after_completion_aborts() {
        let runtime = EmuRuntime::new();
        let (contractor, events) = granted_contractor(&runtime, None);
        contractor
            .lock()
            .finalize(ContractMessage::final_report())
            .unwrap();
        contractor
            .lock()
            .on_message(ContractMessage::cancellation(None));
        assert_eq!(contractor.lock().state(), ContractState::Aborted);
        assert!(events.lock().contains(&"aborted".to_string()));
    }

    #[test]
    fn interim_updates_require_granted() {
        let runtime = EmuRuntime::new();
        let (contractor, _) = granted_contractor(&runtime, None);
        contractor
            .lock()
            .update(ContractMessage::update_report())
            .unwrap();
        assert_eq!(updates_sent(&runtime), 1);
        contractor
            .lock()
            .finalize(ContractMessage::final_report())
            .unwrap();
        let err = contractor
            .lock()
            .update(ContractMessage::update_report())
            .unwrap_err();
        assert!(err.is_state_assertion());
    }
}
