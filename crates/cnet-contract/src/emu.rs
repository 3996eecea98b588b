//! Deterministic in-memory runtime for driving contracts in tests.
//!
//! The clock only moves when a test calls [`EmuRuntime::advance`] or
//! [`EmuRuntime::advance_to`]; outbound messages queue up until
//! [`EmuRuntime::deliver_pending`] routes them (advancing delivers too).
//! Production code never uses this runtime.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use cnet_proto::{ContractMessage, MessageId, Recipient, SessionId};

use crate::expiration::TimerId;
use crate::runtime::{FlagTimerHandle, Listener, Runtime, SharedListener, TimerHandle};

/// One send captured by the emulated transport.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Session that sent the message.
    pub from: SessionId,
    /// Addresses the message was sent to.
    pub recipients: Vec<Recipient>,
    /// The stamped message.
    pub message: ContractMessage,
    /// True for handover sends (delegated bids).
    pub handover: bool,
}

struct Registration {
    address: String,
    listener: SharedListener,
}

struct EmuTimer {
    session: SessionId,
    due: DateTime<Utc>,
    timer: TimerId,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    clock: Mutex<DateTime<Utc>>,
    listeners: Mutex<Vec<(SessionId, Registration)>>,
    timers: Mutex<Vec<EmuTimer>>,
    log: Mutex<Vec<Outbound>>,
    pending: Mutex<VecDeque<Outbound>>,
}

/// The emulated runtime. Cheap to clone; clones share all state.
#[derive(Clone, Default)]
pub struct EmuRuntime {
    inner: Arc<Inner>,
}

impl EmuRuntime {
    /// A runtime with an empty registry and the clock at the Unix epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A shareable handle usable wherever an `Arc<dyn Runtime>` is needed.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn Runtime> {
        Arc::new(self.clone())
    }

    /// Register `listener` under the transport address `address`.
    ///
    /// Several sessions may share an address; a broadcast (or direct) send
    /// to that key reaches all of them.
    pub fn register<L: Listener + 'static>(
        &self,
        address: impl Into<String>,
        listener: L,
    ) -> SharedListener {
        let session = listener.session_id();
        let shared: SharedListener = Arc::new(Mutex::new(listener));
        self.inner.listeners.lock().push((
            session,
            Registration {
                address: address.into(),
                listener: Arc::clone(&shared),
            },
        ));
        shared
    }

    /// Register an already-shared listener under `address`, leaving the
    /// caller a typed handle for driving and inspecting it.
    pub fn register_shared<L: Listener + 'static>(
        &self,
        address: impl Into<String>,
        listener: &Arc<Mutex<L>>,
    ) {
        let session = listener.lock().session_id();
        let shared: SharedListener = Arc::clone(listener) as SharedListener;
        self.inner.listeners.lock().push((
            session,
            Registration {
                address: address.into(),
                listener: shared,
            },
        ));
    }

    /// True while `session` still has a listener registered.
    #[must_use]
    pub fn has_listener(&self, session: SessionId) -> bool {
        self.inner
            .listeners
            .lock()
            .iter()
            .any(|(s, _)| *s == session)
    }

    /// Every message sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<ContractMessage> {
        self.inner
            .log
            .lock()
            .iter()
            .map(|o| o.message.clone())
            .collect()
    }

    /// Every send so far, with its addressing.
    #[must_use]
    pub fn outbound(&self) -> Vec<Outbound> {
        self.inner.log.lock().clone()
    }

    /// Route every queued outbound message to the listeners registered
    /// under its recipient keys, including messages queued while
    /// delivering.
    pub fn deliver_pending(&self) {
        loop {
            let Some(out) = self.inner.pending.lock().pop_front() else {
                return;
            };
            for recipient in &out.recipients {
                for listener in self.listeners_at(&recipient.key) {
                    listener.lock().on_message(out.message.clone());
                }
            }
        }
    }

    /// Move the clock forward by `step`, firing due timers in deadline
    /// order and delivering the traffic they generate.
    pub fn advance(&self, step: Duration) {
        let target = self.now() + step;
        self.advance_to(target);
    }

    /// Move the clock to `target`. No-op when `target` is in the past.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        self.deliver_pending();
        while let Some(timer) = self.pop_due(target) {
            if timer.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            {
                let mut clock = self.inner.clock.lock();
                if *clock < timer.due {
                    *clock = timer.due;
                }
            }
            if let Some(listener) = self.listener_for(timer.session) {
                debug!(session = %timer.session, timer = %timer.timer, "firing timer");
                listener.lock().on_timer(timer.timer);
            }
            self.deliver_pending();
        }
        let mut clock = self.inner.clock.lock();
        if *clock < target {
            *clock = target;
        }
        drop(clock);
        self.deliver_pending();
    }

    fn pop_due(&self, target: DateTime<Utc>) -> Option<EmuTimer> {
        let mut timers = self.inner.timers.lock();
        let idx = timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= target && !t.cancelled.load(Ordering::SeqCst))
            .min_by_key(|(_, t)| t.due)
            .map(|(i, _)| i)?;
        Some(timers.swap_remove(idx))
    }

    fn listener_for(&self, session: SessionId) -> Option<SharedListener> {
        self.inner
            .listeners
            .lock()
            .iter()
            .find(|(s, _)| *s == session)
            .map(|(_, reg)| Arc::clone(&reg.listener))
    }

    fn listeners_at(&self, key: &str) -> Vec<SharedListener> {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, reg)| reg.address == key)
            .map(|(_, reg)| Arc::clone(&reg.listener))
            .collect()
    }

    fn address_of(&self, session: SessionId) -> Option<String> {
        self.inner
            .listeners
            .lock()
            .iter()
            .find(|(s, _)| *s == session)
            .map(|(_, reg)| reg.address.clone())
    }

    fn push(&self, out: Outbound) -> MessageId {
        let id = out.message.message_id;
        self.inner.log.lock().push(out.clone());
        self.inner.pending.lock().push_back(out);
        id
    }
}

impl Runtime for EmuRuntime {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.clock.lock()
    }

    fn send(
        &self,
        from: SessionId,
        recipients: &[Recipient],
        mut msg: ContractMessage,
    ) -> MessageId {
        // the transport stamps the reply address of registered senders
        if let Some(address) = self.address_of(from) {
            msg.reply_to = Some(Recipient::agent(address));
        }
        self.push(Outbound {
            from,
            recipients: recipients.to_vec(),
            message: msg,
            handover: false,
        })
    }

    fn handover(
        &self,
        from: SessionId,
        recipients: &[Recipient],
        msg: ContractMessage,
    ) -> MessageId {
        // delegated bids keep the composing contractor's reply address
        self.push(Outbound {
            from,
            recipients: recipients.to_vec(),
            message: msg,
            handover: true,
        })
    }

    fn schedule(
        &self,
        session: SessionId,
        delay: std::time::Duration,
        timer: TimerId,
    ) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        // out-of-range delays land far enough out to never fire in a test
        let due = self.now() + Duration::from_std(delay).unwrap_or_else(|_| Duration::days(36500));
        self.inner.timers.lock().push(EmuTimer {
            session,
            due,
            timer,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(FlagTimerHandle::new(cancelled))
    }

    fn unregister_listener(&self, session: SessionId) {
        self.inner.listeners.lock().retain(|(s, _)| *s != session);
    }
}
