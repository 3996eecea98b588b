//! In-process runtime backed by real time.
//!
//! Timers are spawned tasks sleeping until their deadline, cancelled
//! through a shared atomic flag. Message delivery is also spawned, so a
//! contract sending from inside one of its own handlers never re-enters
//! its lock. Must run inside a tokio runtime.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use cnet_proto::{ContractMessage, MessageId, Recipient, SessionId};

use crate::expiration::TimerId;
use crate::runtime::{FlagTimerHandle, Listener, Runtime, SharedListener, TimerHandle};

struct Registration {
    address: String,
    listener: SharedListener,
}

#[derive(Default)]
struct Inner {
    listeners: Mutex<HashMap<SessionId, Registration>>,
}

impl Inner {
    fn listeners_at(&self, key: &str) -> Vec<SharedListener> {
        self.listeners
            .lock()
            .values()
            .filter(|reg| reg.address == key)
            .map(|reg| Arc::clone(&reg.listener))
            .collect()
    }

    fn listener_for(&self, session: SessionId) -> Option<SharedListener> {
        self.listeners
            .lock()
            .get(&session)
            .map(|reg| Arc::clone(&reg.listener))
    }

    fn address_of(&self, session: SessionId) -> Option<String> {
        self.listeners
            .lock()
            .get(&session)
            .map(|reg| reg.address.clone())
    }
}

/// Tokio-backed [`Runtime`]. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct TokioRuntime {
    inner: Arc<Inner>,
}

impl TokioRuntime {
    /// A runtime with an empty listener registry.
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
    pub fn register<L: Listener + 'static>(
        &self,
        address: impl Into<String>,
        listener: L,
    ) -> SharedListener {
        let session = listener.session_id();
        let shared: SharedListener = Arc::new(Mutex::new(listener));
        self.inner.listeners.lock().insert(
            session,
            Registration {
                address: address.into(),
                listener: Arc::clone(&shared),
            },
        );
        shared
    }

    fn deliver(&self, recipients: &[Recipient], msg: &ContractMessage) {
        for recipient in recipients {
            for listener in self.inner.listeners_at(&recipient.key) {
                let msg = msg.clone();
                tokio::spawn(async move {
                    listener.lock().on_message(msg);
                });
            }
        }
    }
}

impl Runtime for TokioRuntime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn send(
        &self,
        from: SessionId,
        recipients: &[Recipient],
        mut msg: ContractMessage,
    ) -> MessageId {
        if let Some(address) = self.inner.address_of(from) {
            msg.reply_to = Some(Recipient::agent(address));
        }
        let id = msg.message_id;
        self.deliver(recipients, &msg);
        id
    }

    fn handover(
        &self,
        _from: SessionId,
        recipients: &[Recipient],
        msg: ContractMessage,
    ) -> MessageId {
        let id = msg.message_id;
        self.deliver(recipients, &msg);
        id
    }

    fn schedule(
        &self,
        session: SessionId,
        delay: Duration,
        timer: TimerId,
    ) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            if let Some(listener) = inner.listener_for(session) {
                debug!(session = %session, timer = %timer, "timer fired");
                listener.lock().on_timer(timer);
            }
        });
        Box::new(FlagTimerHandle::new(cancelled))
    }

    fn unregister_listener(&self, session: SessionId) {
        self.inner.listeners.lock().remove(&session);
    }
}
