//! End-to-end negotiation flows over the emulated runtime.
//!
//! Both roles are registered with the transport and every message travels
//! through it:
//! 1. Manager announces, workers bid, the window closes
//! 2. Manager grants, workers execute and report
//! 3. Reports are acknowledged, or the contract falls apart mid-way

use chrono::Duration;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use cnet_contract::contractor::{Contractor, ContractorCore, ContractorPolicy};
use cnet_contract::emu::EmuRuntime;
use cnet_contract::error::ProtocolError;
use cnet_contract::expiration::TimerId;
use cnet_contract::manager::{Manager, ManagerCore, ManagerPolicy};
use cnet_contract::runtime::{Listener, Runtime};
use cnet_contract::state::{ContractState, RecordState};
use cnet_proto::{ContractMessage, MessageKind, Recipient, SessionId};

type Events = Arc<Mutex<Vec<String>>>;
type SharedManager = Arc<Mutex<Manager<Announcer>>>;
type SharedWorker = Arc<Mutex<Contractor<WorkerBrain>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Manager side: announce on initiate, grant every bid when the window closes
// ============================================================================

struct Announcer {
    events: Events,
    update_secs: Option<u32>,
}

impl ManagerPolicy for Announcer {
    fn protocol_id(&self) -> &str {
        "shard-backup"
    }

    fn announce_timeout(&self) -> Duration {
        Duration::seconds(5)
    }

    fn initiate(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        core.announce(ContractMessage::announcement().with_payload(json!({"shard": 7})))?;
        Ok(())
    }

    fn closed(&mut self, core: &mut ManagerCore) -> Result<(), ProtocolError> {
        self.events.lock().push("closed".into());
        let bids: Vec<_> = core
            .records()
            .with_state(&[RecordState::Bid])
            .iter()
            .map(|r| r.bid().message_id)
            .collect();
        let grants = bids
            .into_iter()
            .map(|id| (id, ContractMessage::grant(0, self.update_secs)))
            .collect();
        core.grant(grants)
    }

    fn expired(&mut self, _core: &mut ManagerCore) -> Result<(), ProtocolError> {
        self.events.lock().push("expired".into());
        Ok(())
    }

    fn cancelled(
        &mut self,
        _core: &mut ManagerCore,
        _cancellation: Option<&ContractMessage>,
    ) -> Result<(), ProtocolError> {
        self.events.lock().push("cancelled".into());
        Ok(())
    }

    fn completed(
        &mut self,
        _core: &mut ManagerCore,
        reports: &[ContractMessage],
    ) -> Result<(), ProtocolError> {
        self.events.lock().push(format!("completed:{}", reports.len()));
        Ok(())
    }

    fn aborted(&mut self, _core: &mut ManagerCore) -> Result<(), ProtocolError> {
        self.events.lock().push("aborted".into());
        Ok(())
    }
}

fn spawn_manager(
    runtime: &EmuRuntime,
    recipients: Vec<Recipient>,
    update_secs: Option<u32>,
) -> (SharedManager, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let policy = Announcer {
        events: Arc::clone(&events),
        update_secs,
    };
    let manager = Arc::new(Mutex::new(Manager::new(runtime.handle(), recipients, policy)));
    runtime.register_shared("mgr", &manager);
    (manager, events)
}

// ============================================================================
// Worker side: a spawner listens on the announced address and creates one
// contractor per announcement, the way an agency would
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerMode {
    Bid,
    Refuse,
}

struct WorkerBrain {
    mode: WorkerMode,
    events: Events,
}

impl ContractorPolicy for WorkerBrain {
    fn announced(
        &mut self,
        core: &mut ContractorCore,
        _announcement: &ContractMessage,
    ) -> Result<(), ProtocolError> {
        self.events.lock().push("announced".into());
        match self.mode {
            WorkerMode::Bid => {
                core.bid(ContractMessage::bid(vec![json!({"cost": 3})]))?;
            }
            WorkerMode::Refuse => {
                core.refuse(ContractMessage::refusal())?;
            }
        }
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

struct Spawner {
    session: SessionId,
    runtime: EmuRuntime,
    address: String,
    mode: WorkerMode,
    events: Events,
    worker: Arc<Mutex<Option<SharedWorker>>>,
}

impl Listener for Spawner {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn on_message(&mut self, msg: ContractMessage) {
        if msg.kind() != MessageKind::Announcement {
            return;
        }
        let policy = WorkerBrain {
            mode: self.mode,
            events: Arc::clone(&self.events),
        };
        let contractor = match Contractor::new(self.runtime.handle(), msg.clone(), policy) {
            Ok(contractor) => Arc::new(Mutex::new(contractor)),
            Err(_) => return,
        };
        self.runtime.register_shared(&self.address, &contractor);
        contractor.lock().on_message(msg);
        *self.worker.lock() = Some(contractor);
    }

    fn on_timer(&mut self, _timer: TimerId) {}
}

fn spawn_worker(
    runtime: &EmuRuntime,
    listen: &str,
    address: &str,
    mode: WorkerMode,
) -> (Arc<Mutex<Option<SharedWorker>>>, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let worker = Arc::new(Mutex::new(None));
    runtime.register(
        listen,
        Spawner {
            session: SessionId::new(),
            runtime: runtime.clone(),
            address: address.into(),
            mode,
            events: Arc::clone(&events),
            worker: Arc::clone(&worker),
        },
    );
    (worker, events)
}

fn worker_of(slot: &Arc<Mutex<Option<SharedWorker>>>) -> SharedWorker {
    slot.lock().clone().expect("worker spawned")
}

// ============================================================================
// Flows
// ============================================================================

#[test]
fn broadcast_negotiation_runs_to_acknowledged_reports() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let (manager, mgr_events) = spawn_manager(&runtime, vec![Recipient::broadcast("workers")], None);
    let (slot_a, events_a) = spawn_worker(&runtime, "workers", "w-a", WorkerMode::Bid);
    let (slot_b, events_b) = spawn_worker(&runtime, "workers", "w-b", WorkerMode::Bid);

    manager.lock().initiate().unwrap();
    runtime.deliver_pending();
    assert_eq!(manager.lock().core().records().len(), 2);

    // window closes, the policy grants both bids
    runtime.advance(Duration::seconds(6));
    assert_eq!(manager.lock().state(), ContractState::Granted);
    let worker_a = worker_of(&slot_a);
    let worker_b = worker_of(&slot_b);
    assert_eq!(worker_a.lock().state(), ContractState::Granted);
    assert_eq!(worker_b.lock().state(), ContractState::Granted);

    worker_a
        .lock()
        .finalize(ContractMessage::final_report().with_payload(json!({"ok": true})))
        .unwrap();
    worker_b
        .lock()
        .finalize(ContractMessage::final_report().with_payload(json!({"ok": true})))
        .unwrap();
    runtime.deliver_pending();

    assert_eq!(manager.lock().state(), ContractState::Completed);
    assert!(mgr_events.lock().contains(&"completed:2".to_string()));
    assert!(manager.lock().core().is_terminated());
    assert!(!runtime.has_listener(manager.lock().session_id()));

    assert_eq!(worker_a.lock().state(), ContractState::Acknowledged);
    assert_eq!(worker_b.lock().state(), ContractState::Acknowledged);
    assert!(events_a.lock().contains(&"acknowledged".to_string()));
    assert!(events_b.lock().contains(&"acknowledged".to_string()));
}

#[test]
fn refusing_workers_expire_the_contract() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let (manager, mgr_events) = spawn_manager(&runtime, vec![Recipient::broadcast("workers")], None);
    let (slot_a, _) = spawn_worker(&runtime, "workers", "w-a", WorkerMode::Refuse);
    let (_slot_b, _) = spawn_worker(&runtime, "workers", "w-b", WorkerMode::Refuse);

    manager.lock().initiate().unwrap();
    runtime.deliver_pending();
    assert_eq!(
        manager.lock().core().records().count_in(&[RecordState::Refused]),
        2
    );
    assert_eq!(worker_of(&slot_a).lock().state(), ContractState::Refused);

    runtime.advance(Duration::seconds(6));
    assert_eq!(manager.lock().state(), ContractState::Expired);
    assert!(mgr_events.lock().contains(&"expired".to_string()));
    assert!(manager.lock().core().is_terminated());
}

#[test]
fn point_to_point_bids_close_the_window_early() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let recipients = vec![Recipient::agent("alpha"), Recipient::agent("beta")];
    let (manager, mgr_events) = spawn_manager(&runtime, recipients, None);
    spawn_worker(&runtime, "alpha", "alpha-c", WorkerMode::Bid);
    spawn_worker(&runtime, "beta", "beta-c", WorkerMode::Bid);

    let before = runtime.now();
    manager.lock().initiate().unwrap();
    runtime.deliver_pending();

    // no clock movement needed: both expected bids arrived
    assert_eq!(runtime.now(), before);
    assert_eq!(manager.lock().state(), ContractState::Granted);
    assert!(mgr_events.lock().contains(&"closed".to_string()));
}

#[test]
fn requested_update_reports_flow_while_granted() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let (manager, mgr_events) = spawn_manager(&runtime, vec![Recipient::broadcast("workers")], Some(2));
    let (slot, _) = spawn_worker(&runtime, "workers", "w-a", WorkerMode::Bid);

    manager.lock().initiate().unwrap();
    runtime.deliver_pending();
    runtime.advance(Duration::seconds(5));
    let worker = worker_of(&slot);
    assert!(worker.lock().core().is_reporting());

    runtime.advance(Duration::seconds(4));
    let updates = runtime
        .sent()
        .iter()
        .filter(|m| m.kind() == MessageKind::UpdateReport)
        .count();
    assert_eq!(updates, 2);
    // interim reports never move the manager's state
    assert_eq!(manager.lock().state(), ContractState::Granted);

    worker.lock().finalize(ContractMessage::final_report()).unwrap();
    runtime.deliver_pending();
    assert_eq!(manager.lock().state(), ContractState::Completed);
    assert!(mgr_events.lock().contains(&"completed:1".to_string()));
    assert_eq!(worker.lock().state(), ContractState::Acknowledged);
    assert!(!worker.lock().core().is_reporting());
}

#[test]
fn defecting_worker_cancels_the_whole_contract() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let (manager, mgr_events) = spawn_manager(&runtime, vec![Recipient::broadcast("workers")], None);
    let (slot_a, _) = spawn_worker(&runtime, "workers", "w-a", WorkerMode::Bid);
    let (slot_b, events_b) = spawn_worker(&runtime, "workers", "w-b", WorkerMode::Bid);

    manager.lock().initiate().unwrap();
    runtime.deliver_pending();
    runtime.advance(Duration::seconds(6));

    let worker_a = worker_of(&slot_a);
    let worker_b = worker_of(&slot_b);
    worker_a
        .lock()
        .defect(ContractMessage::cancellation(Some("disk died".into())))
        .unwrap();
    runtime.deliver_pending();

    assert_eq!(worker_a.lock().state(), ContractState::Defected);
    assert_eq!(manager.lock().state(), ContractState::Cancelled);
    assert!(mgr_events.lock().contains(&"cancelled".to_string()));
    assert_eq!(worker_b.lock().state(), ContractState::Cancelled);
    assert!(events_b.lock().contains(&"cancelled".to_string()));
}

#[test]
fn silent_workers_abort_the_contract_at_the_grant_deadline() {
    init_tracing();
    let runtime = EmuRuntime::new();
    let (manager, mgr_events) = spawn_manager(&runtime, vec![Recipient::broadcast("workers")], None);
    let (slot, _) = spawn_worker(&runtime, "workers", "w-a", WorkerMode::Bid);

    manager.lock().initiate().unwrap();
    runtime.deliver_pending();
    runtime.advance(Duration::seconds(6));
    assert_eq!(worker_of(&slot).lock().state(), ContractState::Granted);

    // grant deadline passes with no report
    runtime.advance(Duration::seconds(20));
    assert_eq!(manager.lock().state(), ContractState::Aborted);
    assert!(mgr_events.lock().contains(&"aborted".to_string()));
    assert!(manager.lock().core().is_terminated());
}
