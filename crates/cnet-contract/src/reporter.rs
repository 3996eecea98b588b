//! Recurring update-report timer for granted contractors.

use std::time::Duration;
use tracing::debug;

use cnet_proto::SessionId;

use crate::expiration::TimerId;
use crate::runtime::{Runtime, TimerHandle};

/// Re-arming periodic timer, separate from the single-pending deadline
/// scheduler so a granted contractor can hold both at once.
///
/// The owner claims fires through [`take_fired`](Self::take_fired), sends
/// its report and calls [`rearm`](Self::rearm); stopping is idempotent.
pub struct Reporter {
    session: SessionId,
    period: Duration,
    pending: Option<(TimerId, Box<dyn TimerHandle>)>,
}

impl Reporter {
    /// A stopped reporter for the given session.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            period: Duration::ZERO,
            pending: None,
        }
    }

    /// Arm the reporter with the given period, replacing any pending fire.
    pub fn start(&mut self, runtime: &dyn Runtime, period: Duration) {
        self.stop();
        self.period = period;
        debug!(session = %self.session, ?period, "starting update reporter");
        self.arm(runtime);
    }

    /// Arm the next fire at the configured period.
    pub fn rearm(&mut self, runtime: &dyn Runtime) {
        if self.pending.is_some() {
            return;
        }
        self.arm(runtime);
    }

    fn arm(&mut self, runtime: &dyn Runtime) {
        let id = TimerId::next();
        let handle = runtime.schedule(self.session, self.period, id);
        self.pending = Some((id, handle));
    }

    /// Cancel the pending fire, if any. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some((id, handle)) = self.pending.take() {
            debug!(session = %self.session, timer = %id, "stopping update reporter");
            handle.cancel();
        }
    }

    /// Claim a fired timer; `true` when `id` is this reporter's pending
    /// fire.
    pub fn take_fired(&mut self, id: TimerId) -> bool {
        match &self.pending {
            Some((pending, _)) if *pending == id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// True while a fire is pending.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}
