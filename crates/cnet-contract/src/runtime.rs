//! Collaborator interfaces to the transport and timer layer.
//!
//! The negotiation core never talks to a network or a clock directly; it
//! goes through a [`Runtime`], and the runtime feeds inbound messages and
//! fired timers back through a [`Listener`]. The runtime is responsible for
//! serializing those two triggers per contract — exactly one of {an inbound
//! message, a fired timer} is processed at a time for a given session.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cnet_proto::{ContractMessage, MessageId, Recipient, SessionId};

use crate::expiration::TimerId;

/// Cancellable handle to one scheduled timer.
///
/// Cancelling an already-fired or already-cancelled timer is a safe no-op.
pub trait TimerHandle: Send {
    /// Prevent the timer from delivering, if it has not fired yet.
    fn cancel(&self);
}

/// The transport/addressing collaborator.
///
/// Delivery is fire-and-continue: `send` returns the correlation handle
/// immediately and never blocks on the receiver.
pub trait Runtime: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Deliver `msg` to `recipients` on behalf of session `from`.
    fn send(
        &self,
        from: SessionId,
        recipients: &[Recipient],
        msg: ContractMessage,
    ) -> MessageId;

    /// Forward a message composed by someone else (a delegated bid) without
    /// restamping its sender.
    fn handover(
        &self,
        from: SessionId,
        recipients: &[Recipient],
        msg: ContractMessage,
    ) -> MessageId;

    /// Arrange for `timer` to be delivered to `session`'s listener after
    /// `delay`. The returned handle cancels delivery.
    fn schedule(
        &self,
        session: SessionId,
        delay: Duration,
        timer: TimerId,
    ) -> Box<dyn TimerHandle>;

    /// Drop the listener registration for `session`; no further messages or
    /// timers are delivered to it.
    fn unregister_listener(&self, session: SessionId);
}

/// The protocol-role side of the listener registry.
pub trait Listener: Send {
    /// The session replies are routed back to.
    fn session_id(&self) -> SessionId;

    /// An inbound protocol message for this session.
    fn on_message(&mut self, msg: ContractMessage);

    /// A previously scheduled timer fired.
    fn on_timer(&mut self, timer: TimerId);
}

/// A listener shared between the owning application and the runtime.
pub type SharedListener = Arc<Mutex<dyn Listener>>;

/// Timer handle backed by an atomic cancellation flag, shared with the task
/// or queue entry that would fire the timer.
pub struct FlagTimerHandle(Arc<AtomicBool>);

impl FlagTimerHandle {
    /// A handle wrapping the given flag.
    #[must_use]
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

impl TimerHandle for FlagTimerHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
