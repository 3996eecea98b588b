//! Single-pending expiration scheduling.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use cnet_proto::SessionId;

use crate::error::ProtocolError;
use crate::runtime::{Runtime, TimerHandle};

/// Process-unique identifier for one scheduled timer.
///
/// Fired timers are matched against the pending id, so a timer that was
/// cancelled after its delivery was already in flight is recognized as
/// stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    /// Allocate the next process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

struct Pending<E> {
    id: TimerId,
    deadline: DateTime<Utc>,
    expiry: E,
    handle: Box<dyn TimerHandle>,
}

/// Schedules at most one pending deferred action for its owner.
///
/// Arming while a timer is pending, or arming for a deadline already in the
/// past, is a sequencing bug in the caller and fails immediately; the
/// lifecycle methods always cancel before rearming. `E` is the owner's
/// expiry token type naming the action to run when the timer fires.
pub struct ExpirationScheduler<E> {
    session: SessionId,
    pending: Option<Pending<E>>,
}

impl<E: Copy + fmt::Debug> ExpirationScheduler<E> {
    /// A scheduler for the given session, with nothing pending.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            pending: None,
        }
    }

    /// Arm a timer for `deadline` carrying the `expiry` token.
    pub fn schedule(
        &mut self,
        runtime: &dyn Runtime,
        deadline: DateTime<Utc>,
        expiry: E,
    ) -> Result<TimerId, ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::TimerAlreadyArmed);
        }
        let now = runtime.now();
        if deadline < now {
            return Err(ProtocolError::DeadlineInPast { deadline, now });
        }
        let delay = (deadline - now).to_std().unwrap_or_default();
        let id = TimerId::next();
        let handle = runtime.schedule(self.session, delay, id);
        debug!(
            session = %self.session,
            timer = %id,
            %deadline,
            expiry = ?expiry,
            "armed expiration timer"
        );
        self.pending = Some(Pending {
            id,
            deadline,
            expiry,
            handle,
        });
        Ok(id)
    }

    /// Cancel the pending timer, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(session = %self.session, timer = %pending.id, "cancelled expiration timer");
            pending.handle.cancel();
        }
    }

    /// Claim a fired timer. Yields the expiry token when `id` matches the
    /// pending timer and clears it; stale ids yield `None`.
    pub fn take_fired(&mut self, id: TimerId) -> Option<E> {
        match &self.pending {
            Some(pending) if pending.id == id => self.pending.take().map(|p| p.expiry),
            _ => {
                debug!(session = %self.session, timer = %id, "stale timer fired, ignoring");
                None
            }
        }
    }

    /// True while a timer is pending.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Deadline of the pending timer, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.as_ref().map(|p| p.deadline)
    }
}
