//! `sendmsg`: start the same service `run` does, enqueue one message built from flags, then fall
//! into the same stdin command loop so the attempt(s) can be observed.

use crucible_base::{err, Result, Time};
use crucible_smtp::{SmtpMsgToSend, TlsAssurance};
use crucible_store::StopSignal;

use super::run_cmd;

#[allow(clippy::too_many_arguments)]
pub fn run(
    stgs: Option<String>,
    from: Option<String>,
    mbox: Vec<String>,
    content: Option<String>,
    retry: Option<String>,
    tls_req: Option<String>,
    base_secs_max: Option<u32>,
    min_bps: Option<u32>,
) -> Result<()> {
    let config = run_cmd::load_settings(stgs)?;
    let store = run_cmd::open_store()?;

    let sender = from.ok_or_else(|| err("sendmsg: --from is required"))?;
    if mbox.is_empty() {
        return Err(err("sendmsg: at least one --mbox is required"));
    }
    let body = match content {
        Some(path) => std::fs::read(&path).map_err(|e| err(format!("could not read {path:?}: {e}")))?,
        None => b"Subject: test\r\n\r\nThis is a test message.\r\n".to_vec(),
    };

    let mut msg = SmtpMsgToSend::new(sender, mbox, body, config.sender_computer_name.clone(), Time::now());

    if let Some(retry) = retry {
        let minutes: Vec<i64> = retry
            .split(',')
            .map(|s| s.trim().parse::<i64>().map_err(|_| err(format!("bad --retry entry {s:?}"))))
            .collect::<Result<_>>()?;
        msg.retry_schedule_minutes = minutes;
    }
    if let Some(tls_req) = tls_req {
        msg.tls_requirement = TlsAssurance::parse(&tls_req).ok_or_else(|| err(format!("bad --tlsreq {tls_req:?}")))?;
    }
    if let Some(base_secs_max) = base_secs_max {
        msg.base_send_seconds_max = base_secs_max;
    }
    if let Some(min_bps) = min_bps {
        msg.min_send_bytes_per_sec = min_bps;
    }

    let stop = StopSignal::new();
    let service = run_cmd::start_service(store.clone(), config)?;
    let id = crucible_smtp::enqueue(&store, Some(&service), &stop, msg)?;
    println!("enqueued {id}");

    run_cmd::command_loop(&store, &stop, service)
}
