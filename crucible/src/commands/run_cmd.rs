//! `run`/`sendmsg` shared machinery: load the settings envelope, open the entity store, start
//! the send-queue service with a logging observer, and block on a simple stdin command loop.
//! The original test harness drove this from raw single-key input; nothing in this workspace's
//! dependency stack reads a terminal in raw mode, so this reads whole lines instead (`q` to quit,
//! `l` to list in-flight messages, `c` to clear idle ones) -- a documented simplification.

use std::io::BufRead;
use std::sync::Arc;

use crucible_base::{err, Result, Time};
use crucible_crypto::OsRng;
use crucible_smtp::{MsgStatus, SendConfig, SendObserver, Service, ServiceConfig, SmtpMsgToSend};
use crucible_store::{EntityStore, ObjId, StopSignal};

const DEFAULT_SETTINGS_FILE: &str = "crucible.stgs";
const DEFAULT_STORE_DIR: &str = "crucible-store-data";

struct LoggingObserver;

impl SendObserver for LoggingObserver {
    fn on_reset(&self, msg_id: ObjId) {
        println!("{} reset stuck send {msg_id}", Time::now().format_iso_micro_z());
    }
    fn on_attempt(&self, msg_id: ObjId, attempt_number: u32) {
        println!("{} attempt #{attempt_number} for {msg_id}", Time::now().format_iso_micro_z());
    }
    fn on_result(&self, msg_id: ObjId, status: MsgStatus) {
        println!("{} {msg_id} settled: {} ({})", Time::now().format_iso_micro_z(), status.as_str(), status.describe());
    }
}

pub fn load_settings(stgs: Option<String>) -> Result<SendConfig> {
    let path = stgs.unwrap_or_else(|| DEFAULT_SETTINGS_FILE.to_string());
    match std::fs::read_to_string(&path) {
        Ok(text) => crucible_smtp::config::parse_config_envelope(&text),
        Err(_) => {
            println!("no settings file at {path:?}, using defaults (direct delivery)");
            Ok(SendConfig::default())
        }
    }
}

pub fn open_store() -> Result<Arc<EntityStore>> {
    Ok(Arc::new(EntityStore::open(DEFAULT_STORE_DIR, Arc::new(OsRng))?))
}

pub fn start_service(store: Arc<EntityStore>, config: SendConfig) -> Result<Service> {
    Service::start(store, Arc::new(config), ServiceConfig::default(), Arc::new(LoggingObserver))
}

fn list_in_flight(store: &EntityStore, stop: &StopSignal) -> Result<()> {
    let mut rows = Vec::new();
    store.run_tx(stop, |txn| {
        txn.enum_all_children_of_kind::<SmtpMsgToSend>(ObjId::ROOT, |loaded| {
            rows.push((loaded.entity_id, loaded.value.sender.clone(), loaded.value.status));
            true
        })
    })?;
    if rows.is_empty() {
        println!("(no messages in the store)");
    }
    for (id, sender, status) in rows {
        println!("{id}  from={sender}  status={}", status.as_str());
    }
    Ok(())
}

fn clear_idle(store: &EntityStore, stop: &StopSignal) -> Result<()> {
    let mut cleared = 0usize;
    store.run_tx_exclusive(|txn| {
        let mut idle_ids = Vec::new();
        txn.enum_all_children_of_kind::<SmtpMsgToSend>(ObjId::ROOT, |loaded| {
            if loaded.value.status == MsgStatus::Idle {
                idle_ids.push(loaded.entity_id);
            }
            true
        })?;
        for id in idle_ids {
            let loaded = txn.load::<SmtpMsgToSend>(id)?;
            txn.remove(&loaded)?;
            cleared += 1;
        }
        Ok(())
    })?;
    println!("cleared {cleared} idle message(s)");
    Ok(())
}

/// Blocks reading lines from stdin until `q`/EOF, dispatching `l` and `c`, then stops `service`.
pub fn command_loop(store: &EntityStore, stop: &StopSignal, service: Service) -> Result<()> {
    println!("send queue running; 'l' lists in-flight messages, 'c' clears idle ones, 'q' quits");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| err(format!("stdin read failed: {e}")))?;
        match line.trim() {
            "q" | "Q" => break,
            "l" | "L" | " " => list_in_flight(store, stop)?,
            "c" | "C" => clear_idle(store, stop)?,
            "" => {}
            other => println!("unrecognized command {other:?}"),
        }
    }
    service.stop();
    Ok(())
}

pub fn run(stgs: Option<String>) -> Result<()> {
    let config = load_settings(stgs)?;
    let store = open_store()?;
    let service = start_service(store.clone(), config)?;
    let stop = StopSignal::new();
    command_loop(&store, &stop, service)
}
