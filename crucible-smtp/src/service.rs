//! Worker-pool orchestration: one pump thread finds due messages and hands them to a fixed pool
//! of worker threads, which run `attempt.rs`'s state machine and fold the outcome back through a
//! transaction. One thread per role, woken by a trigger rather than polled tightly -- generalized
//! from dispatching node-to-node messages to driving SMTP delivery attempts.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use crucible_base::{err, Result, Time};
use crucible_store::{EntityStore, KeyValue, ObjId, StopSignal};
use tracing::{info, warn};

use crate::attempt::{attempt_message, require_connectable};
use crate::config::SendConfig;
use crate::queue::{WorkItem, WorkQueue};
use crate::resolve::MxResolver;
use crate::schema::{MsgStatus, SmtpMsgToSend};
use crate::tls::{InMemoryPinStore, PinStore};

/// Observes service activity without touching the store directly. Every callback runs outside
/// the transaction that produced it; a panicking callback is caught and logged, never allowed to
/// kill a worker thread.
pub trait SendObserver: Send + Sync {
    fn on_reset(&self, _msg_id: ObjId) {}
    fn on_attempt(&self, _msg_id: ObjId, _attempt_number: u32) {}
    fn on_result(&self, _msg_id: ObjId, _status: MsgStatus) {}
}

pub struct NullObserver;
impl SendObserver for NullObserver {}

pub struct ServiceConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub poll_interval: StdDuration,
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            worker_count: 4,
            queue_capacity: 64,
            poll_interval: StdDuration::from_secs(30),
        }
    }
}

pub struct Service {
    stop: Arc<StopSignal>,
    queue: Arc<WorkQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl Service {
    /// Resets any message left `Sending` from a prior crash back to `Idle`, then starts the pump
    /// and worker threads.
    pub fn start(store: Arc<EntityStore>, send_config: Arc<SendConfig>, service_config: ServiceConfig, observer: Arc<dyn SendObserver>) -> Result<Service> {
        require_connectable(&send_config)?;
        let stop = Arc::new(StopSignal::new());
        let queue = Arc::new(WorkQueue::new(service_config.queue_capacity));
        let pins: Arc<dyn PinStore> = Arc::new(InMemoryPinStore::default());
        let resolver = Arc::new(MxResolver::new()?);

        reset_stuck_sends(&store, &stop, observer.as_ref())?;

        let mut handles = Vec::new();
        {
            let store = store.clone();
            let queue = queue.clone();
            let stop = stop.clone();
            let interval = service_config.poll_interval;
            handles.push(std::thread::spawn(move || pump_loop(store, queue, stop, interval)));
        }
        for _ in 0..service_config.worker_count.max(1) {
            let store = store.clone();
            let queue = queue.clone();
            let stop = stop.clone();
            let send_config = send_config.clone();
            let resolver = resolver.clone();
            let pins = pins.clone();
            let observer = observer.clone();
            handles.push(std::thread::spawn(move || worker_loop(store, queue, stop, send_config, resolver, pins, observer)));
        }

        Ok(Service { stop, queue, handles })
    }

    /// Wakes the pump thread immediately, e.g. right after a new message is enqueued, instead of
    /// waiting out the rest of its poll interval.
    pub fn signal_pump(&self) {
        self.queue.signal_pump();
    }

    pub fn stop(self) {
        self.stop.cancel();
        self.queue.signal_pump();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn reset_stuck_sends(store: &EntityStore, stop: &StopSignal, observer: &dyn SendObserver) -> Result<()> {
    let mut reset_ids = Vec::new();
    store.run_tx_exclusive(|txn| {
        reset_ids.clear();
        let ids_to_reset = {
            let mut found = Vec::new();
            txn.enum_all_children_of_kind::<SmtpMsgToSend>(ObjId::ROOT, |loaded| {
                if loaded.value.status == MsgStatus::Sending {
                    found.push(loaded.entity_id);
                }
                true
            })?;
            found
        };
        for id in ids_to_reset {
            let loaded = txn.load::<SmtpMsgToSend>(id)?;
            let mut value = loaded.value.clone();
            value.status = MsgStatus::Idle;
            txn.update(&loaded, value)?;
            reset_ids.push(id);
        }
        Ok(())
    })?;
    for id in &reset_ids {
        if stop.is_cancelled() {
            break;
        }
        call_guarded(|| observer.on_reset(*id));
    }
    Ok(())
}

fn call_guarded(f: impl FnOnce() + std::panic::UnwindSafe) {
    if std::panic::catch_unwind(f).is_err() {
        warn!("send observer callback panicked; ignoring");
    }
}

/// Scans for `Idle` messages whose `next_attempt_time` has arrived, transactionally marks them
/// `Sending`, and pushes them onto the work queue for a worker to pick up.
fn pump_loop(store: Arc<EntityStore>, queue: Arc<WorkQueue>, stop: Arc<StopSignal>, interval: StdDuration) {
    while !stop.is_cancelled() {
        if let Err(e) = pump_once(&store, &queue, &stop) {
            warn!(error = %e, "pump scan failed");
        }
        queue.wait_trigger(interval, &stop);
    }
}

fn pump_once(store: &EntityStore, queue: &Arc<WorkQueue>, stop: &StopSignal) -> Result<()> {
    let now = Time::now();
    let due_ids = store.run_tx(stop, |txn| {
        let mut due = Vec::new();
        txn.find_children::<SmtpMsgToSend>(ObjId::ROOT, &KeyValue::Time(i64::MIN), Some(&KeyValue::Time(now.as_filetime_units())), |loaded| {
            if loaded.value.status == MsgStatus::Idle {
                due.push(loaded.entity_id);
            }
            true
        })?;
        for id in &due {
            let loaded = txn.load::<SmtpMsgToSend>(*id)?;
            let mut value = loaded.value.clone();
            value.status = MsgStatus::Sending;
            txn.update(&loaded, value)?;
        }
        Ok(due)
    })?;
    for id in due_ids {
        if !queue.push(WorkItem { msg_id: id }, stop) {
            break;
        }
    }
    Ok(())
}

fn worker_loop(store: Arc<EntityStore>, queue: Arc<WorkQueue>, stop: Arc<StopSignal>, config: Arc<SendConfig>, resolver: Arc<MxResolver>, pins: Arc<dyn PinStore>, observer: Arc<dyn SendObserver>) {
    while let Some(item) = queue.pop(&stop) {
        if let Err(e) = attempt_one(&store, &stop, item.msg_id, &config, &resolver, pins.as_ref(), observer.as_ref()) {
            warn!(error = %e, msg_id = ?item.msg_id, "attempt failed to complete");
        }
    }
}

fn attempt_one(store: &EntityStore, stop: &StopSignal, msg_id: ObjId, config: &SendConfig, resolver: &MxResolver, pins: &dyn PinStore, observer: &dyn SendObserver) -> Result<()> {
    let msg = store.run_tx(stop, |txn| Ok(txn.load::<SmtpMsgToSend>(msg_id)?.value.clone()))?;

    info!(msg_id = ?msg_id, attempt = msg.attempts + 1, "starting delivery attempt");
    let outcome = attempt_message(&msg, config, resolver, pins)?;

    let next_attempt_number = msg.attempts + 1;
    let status = store.run_tx(stop, |txn| {
        let loaded = txn.load::<SmtpMsgToSend>(msg_id)?;
        let mut value = loaded.value.clone();
        value.apply_attempt_outcome(outcome.mailbox_outcomes.clone(), Time::now());
        if outcome.tls_achieved.is_some() {
            value.tls_achieved = outcome.tls_achieved;
        }
        let status = value.status;
        txn.update(&loaded, value)?;
        Ok(status)
    })?;

    call_guarded(|| observer.on_attempt(msg_id, next_attempt_number));
    if status.is_terminal() {
        call_guarded(|| observer.on_result(msg_id, status));
    }
    Ok(())
}

/// Enqueues a new message for delivery under the store root, signalling the pump so it doesn't
/// wait out its poll interval.
pub fn enqueue(store: &EntityStore, service: Option<&Service>, stop: &StopSignal, msg: SmtpMsgToSend) -> Result<ObjId> {
    if msg.mailboxes.is_empty() {
        return Err(err("enqueue: message has no recipients"));
    }
    let id = store.run_tx(stop, |txn| Ok(txn.insert_parent_exists(ObjId::ROOT, msg.clone())?.entity_id))?;
    if let Some(service) = service {
        service.signal_pump();
    }
    Ok(id)
}
