//! The durable unit of work: `SmtpMsgToSend`, its per-mailbox outcome bookkeeping, and the
//! default retry schedule. Stored as a `crucible_store::Entity` keyed by `nextAttemptTime` so
//! the pump thread can range-scan "due" messages with `Txn::find_children`.

use crucible_base::{err, Result, Time};
use crucible_store::{Entity, KeyPolicy, KeyValue, KindId};

pub const KIND_SMTP_MSG_TO_SEND: KindId = KindId(100);

/// `10, 15, 25, 35, 50, 75, 115, 170, 215, 215, 215` minutes: cumulative ~19h, chosen to exhaust
/// retries within the next business day.
pub const DEFAULT_RETRY_SCHEDULE_MINUTES: &[i64] = &[10, 15, 25, 35, 50, 75, 115, 170, 215, 215, 215];

/// Maximum reply lines recorded per mailbox failure.
pub const MAX_REPLY_LINES: usize = 5;

/// Ordered: a later variant subsumes every guarantee of an earlier one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum TlsAssurance {
    None,
    Unverified,
    DomainMatch,
    TofuOnly,
    TofuPinned,
}

impl TlsAssurance {
    pub const ALL: [TlsAssurance; 5] = [
        TlsAssurance::None,
        TlsAssurance::Unverified,
        TlsAssurance::DomainMatch,
        TlsAssurance::TofuOnly,
        TlsAssurance::TofuPinned,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            TlsAssurance::None => "no TLS negotiated; traffic ran in the clear",
            TlsAssurance::Unverified => "TLS negotiated but the peer certificate was not checked",
            TlsAssurance::DomainMatch => "TLS negotiated and the certificate chains to a trusted root matching the domain",
            TlsAssurance::TofuOnly => "TLS negotiated; certificate fingerprint accepted on first use, not yet pinned",
            TlsAssurance::TofuPinned => "TLS negotiated; certificate fingerprint matched a previously pinned value",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsAssurance::None => "none",
            TlsAssurance::Unverified => "unverified",
            TlsAssurance::DomainMatch => "domain_match",
            TlsAssurance::TofuOnly => "tofu_only",
            TlsAssurance::TofuPinned => "tofu_pinned",
        }
    }

    pub fn parse(s: &str) -> Option<TlsAssurance> {
        Some(match s {
            "none" => TlsAssurance::None,
            "unverified" => TlsAssurance::Unverified,
            "domain_match" => TlsAssurance::DomainMatch,
            "tofu_only" => TlsAssurance::TofuOnly,
            "tofu_pinned" => TlsAssurance::TofuPinned,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    Connect,
    Ehlo,
    Tls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Quit,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Connect,
        Stage::Ehlo,
        Stage::Tls,
        Stage::Auth,
        Stage::MailFrom,
        Stage::RcptTo,
        Stage::Data,
        Stage::Quit,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            Stage::Connect => "opening the TCP connection to the relay or MX host",
            Stage::Ehlo => "sending EHLO and parsing the server's capability list",
            Stage::Tls => "the STARTTLS upgrade",
            Stage::Auth => "the AUTH exchange",
            Stage::MailFrom => "the MAIL FROM command",
            Stage::RcptTo => "the RCPT TO command",
            Stage::Data => "the DATA command and dot-stuffed message body",
            Stage::Quit => "the closing QUIT command",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Ehlo => "ehlo",
            Stage::Tls => "tls",
            Stage::Auth => "auth",
            Stage::MailFrom => "mail_from",
            Stage::RcptTo => "rcpt_to",
            Stage::Data => "data",
            Stage::Quit => "quit",
        }
    }

    fn parse(s: &str) -> Option<Stage> {
        Some(match s {
            "connect" => Stage::Connect,
            "ehlo" => Stage::Ehlo,
            "tls" => Stage::Tls,
            "auth" => Stage::Auth,
            "mail_from" => Stage::MailFrom,
            "rcpt_to" => Stage::RcptTo,
            "data" => Stage::Data,
            "quit" => Stage::Quit,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorClass {
    Network,
    TlsRequired,
    TlsFailed,
    AuthFailed,
    ReplyPerm,
    ReplyTemp,
    SizeExceeded,
    TooSlow,
    Timeout,
    Internal,
}

impl ErrorClass {
    /// Permanent error classes move a mailbox straight to the failed list; everything else is
    /// retried on the message's schedule.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorClass::TlsRequired | ErrorClass::AuthFailed | ErrorClass::ReplyPerm | ErrorClass::SizeExceeded
        )
    }

    pub const ALL: [ErrorClass; 10] = [
        ErrorClass::Network,
        ErrorClass::TlsRequired,
        ErrorClass::TlsFailed,
        ErrorClass::AuthFailed,
        ErrorClass::ReplyPerm,
        ErrorClass::ReplyTemp,
        ErrorClass::SizeExceeded,
        ErrorClass::TooSlow,
        ErrorClass::Timeout,
        ErrorClass::Internal,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            ErrorClass::Network => "connection refused, reset, or otherwise failed at the socket layer",
            ErrorClass::TlsRequired => "the configured TLS requirement could not be met",
            ErrorClass::TlsFailed => "the TLS handshake itself failed",
            ErrorClass::AuthFailed => "the server rejected the AUTH exchange",
            ErrorClass::ReplyPerm => "a permanent (5xx) SMTP reply",
            ErrorClass::ReplyTemp => "a temporary (4xx) SMTP reply",
            ErrorClass::SizeExceeded => "the message exceeds the server's advertised SIZE limit",
            ErrorClass::TooSlow => "the connection's sustained transfer rate fell below the configured minimum",
            ErrorClass::Timeout => "no response arrived within the attempt's deadline",
            ErrorClass::Internal => "an error not attributable to the network or the remote server",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::TlsRequired => "tls_required",
            ErrorClass::TlsFailed => "tls_failed",
            ErrorClass::AuthFailed => "auth_failed",
            ErrorClass::ReplyPerm => "reply_perm",
            ErrorClass::ReplyTemp => "reply_temp",
            ErrorClass::SizeExceeded => "size_exceeded",
            ErrorClass::TooSlow => "too_slow",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Internal => "internal",
        }
    }

    fn parse(s: &str) -> Option<ErrorClass> {
        Some(match s {
            "network" => ErrorClass::Network,
            "tls_required" => ErrorClass::TlsRequired,
            "tls_failed" => ErrorClass::TlsFailed,
            "auth_failed" => ErrorClass::AuthFailed,
            "reply_perm" => ErrorClass::ReplyPerm,
            "reply_temp" => ErrorClass::ReplyTemp,
            "size_exceeded" => ErrorClass::SizeExceeded,
            "too_slow" => ErrorClass::TooSlow,
            "timeout" => ErrorClass::Timeout,
            "internal" => ErrorClass::Internal,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FailureRecord {
    pub stage: Stage,
    pub error_class: ErrorClass,
    pub reply_code: Option<u16>,
    pub enhanced_status: Option<String>,
    /// Truncated to `MAX_REPLY_LINES`.
    pub reply_lines: Vec<String>,
}

impl FailureRecord {
    pub fn new(stage: Stage, error_class: ErrorClass, reply_code: Option<u16>, enhanced_status: Option<String>, mut reply_lines: Vec<String>) -> FailureRecord {
        reply_lines.truncate(MAX_REPLY_LINES);
        FailureRecord {
            stage,
            error_class,
            reply_code,
            enhanced_status,
            reply_lines,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum MailboxState {
    Pending,
    Accepted,
    Rejected(FailureRecord),
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Mailbox {
    pub address: String,
    pub state: MailboxState,
}

impl Mailbox {
    pub fn pending(address: impl Into<String>) -> Mailbox {
        Mailbox {
            address: address.into(),
            state: MailboxState::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MsgStatus {
    Idle,
    Sending,
    FinalSuccess,
    FinalPermFail,
    FinalPartialFail,
}

impl MsgStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgStatus::FinalSuccess | MsgStatus::FinalPermFail | MsgStatus::FinalPartialFail)
    }

    pub const ALL: [MsgStatus; 5] = [
        MsgStatus::Idle,
        MsgStatus::Sending,
        MsgStatus::FinalSuccess,
        MsgStatus::FinalPermFail,
        MsgStatus::FinalPartialFail,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            MsgStatus::Idle => "waiting for its next attempt time",
            MsgStatus::Sending => "claimed by a worker, attempt in progress",
            MsgStatus::FinalSuccess => "every mailbox accepted",
            MsgStatus::FinalPermFail => "every mailbox rejected or the retry schedule ran out",
            MsgStatus::FinalPartialFail => "some mailboxes accepted, others rejected or exhausted",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgStatus::Idle => "idle",
            MsgStatus::Sending => "sending",
            MsgStatus::FinalSuccess => "final_success",
            MsgStatus::FinalPermFail => "final_perm_fail",
            MsgStatus::FinalPartialFail => "final_partial_fail",
        }
    }

    fn parse(s: &str) -> Option<MsgStatus> {
        Some(match s {
            "idle" => MsgStatus::Idle,
            "sending" => MsgStatus::Sending,
            "final_success" => MsgStatus::FinalSuccess,
            "final_perm_fail" => MsgStatus::FinalPermFail,
            "final_partial_fail" => MsgStatus::FinalPartialFail,
            _ => return None,
        })
    }
}

/// A message queued for outbound delivery: envelope, stored MIME content, per-mailbox progress,
/// and the retry/rate-limit knobs governing its attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct SmtpMsgToSend {
    pub sender: String,
    pub mailboxes: Vec<Mailbox>,
    /// The already-emitted MIME message (headers + body), streamed verbatim during `DATA`.
    pub content: Vec<u8>,
    pub status: MsgStatus,
    pub attempts: u32,
    pub next_attempt_time: Time,
    pub retry_schedule_minutes: Vec<i64>,
    pub tls_requirement: TlsAssurance,
    pub sender_computer_name: String,
    pub base_send_seconds_max: u32,
    pub min_send_bytes_per_sec: u32,
    pub tls_achieved: Option<TlsAssurance>,
}

impl SmtpMsgToSend {
    pub fn new(sender: impl Into<String>, recipients: impl IntoIterator<Item = String>, content: Vec<u8>, sender_computer_name: impl Into<String>, now: Time) -> SmtpMsgToSend {
        SmtpMsgToSend {
            sender: sender.into(),
            mailboxes: recipients.into_iter().map(Mailbox::pending).collect(),
            content,
            status: MsgStatus::Idle,
            attempts: 0,
            next_attempt_time: now,
            retry_schedule_minutes: DEFAULT_RETRY_SCHEDULE_MINUTES.to_vec(),
            tls_requirement: TlsAssurance::Unverified,
            sender_computer_name: sender_computer_name.into(),
            base_send_seconds_max: 300,
            min_send_bytes_per_sec: 1000,
            tls_achieved: None,
        }
    }

    pub fn pending_mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.mailboxes.iter().filter(|m| m.state == MailboxState::Pending)
    }

    /// The delay before the next attempt, given `attempts` already made. `None` once the
    /// schedule is exhausted.
    pub fn next_delay_minutes(&self) -> Option<i64> {
        self.retry_schedule_minutes.get(self.attempts as usize).copied()
    }

    /// Folds this attempt's per-mailbox outcomes in, advances `attempts`/`next_attempt_time`,
    /// and settles `status` once every mailbox is resolved or the schedule is exhausted.
    pub fn apply_attempt_outcome(&mut self, outcomes: Vec<(usize, MailboxState)>, now: Time) {
        for (idx, state) in outcomes {
            if let Some(mailbox) = self.mailboxes.get_mut(idx) {
                mailbox.state = state;
            }
        }
        self.attempts += 1;
        let still_pending = self.mailboxes.iter().any(|m| m.state == MailboxState::Pending);
        if !still_pending {
            self.settle();
        } else if let Some(delay) = self.next_delay_minutes() {
            self.next_attempt_time = now + crucible_base::Duration::from_minutes(delay);
        } else {
            // schedule exhausted: any mailbox left pending is treated as a permanent failure.
            for mailbox in &mut self.mailboxes {
                if mailbox.state == MailboxState::Pending {
                    mailbox.state = MailboxState::Rejected(FailureRecord::new(
                        Stage::Connect,
                        ErrorClass::Timeout,
                        None,
                        None,
                        vec!["retry schedule exhausted".to_string()],
                    ));
                }
            }
            self.settle();
        }
    }

    fn settle(&mut self) {
        let accepted = self.mailboxes.iter().filter(|m| m.state == MailboxState::Accepted).count();
        let rejected = self.mailboxes.iter().filter(|m| matches!(m.state, MailboxState::Rejected(_))).count();
        self.status = if rejected == 0 {
            MsgStatus::FinalSuccess
        } else if accepted == 0 {
            MsgStatus::FinalPermFail
        } else {
            MsgStatus::FinalPartialFail
        };
    }
}

fn mailbox_to_json(m: &Mailbox) -> serde_json::Value {
    let state = match &m.state {
        MailboxState::Pending => serde_json::json!({"kind": "pending"}),
        MailboxState::Accepted => serde_json::json!({"kind": "accepted"}),
        MailboxState::Rejected(r) => serde_json::json!({
            "kind": "rejected",
            "stage": r.stage.as_str(),
            "error_class": r.error_class.as_str(),
            "reply_code": r.reply_code,
            "enhanced_status": r.enhanced_status,
            "reply_lines": r.reply_lines,
        }),
    };
    serde_json::json!({"address": m.address, "state": state})
}

fn mailbox_from_json(v: &serde_json::Value) -> Result<Mailbox> {
    let address = v["address"].as_str().ok_or_else(|| err("mailbox: missing address"))?.to_string();
    let state_json = &v["state"];
    let state = match state_json["kind"].as_str() {
        Some("pending") => MailboxState::Pending,
        Some("accepted") => MailboxState::Accepted,
        Some("rejected") => {
            let stage = Stage::parse(state_json["stage"].as_str().unwrap_or_default()).ok_or_else(|| err("mailbox: bad stage"))?;
            let error_class = ErrorClass::parse(state_json["error_class"].as_str().unwrap_or_default()).ok_or_else(|| err("mailbox: bad error_class"))?;
            let reply_code = state_json["reply_code"].as_u64().map(|n| n as u16);
            let enhanced_status = state_json["enhanced_status"].as_str().map(str::to_string);
            let reply_lines = state_json["reply_lines"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            MailboxState::Rejected(FailureRecord::new(stage, error_class, reply_code, enhanced_status, reply_lines))
        }
        _ => return Err(err("mailbox: bad state kind")),
    };
    Ok(Mailbox { address, state })
}

impl Entity for SmtpMsgToSend {
    const KIND: KindId = KIND_SMTP_MSG_TO_SEND;

    fn key_policy() -> Option<KeyPolicy> {
        Some(KeyPolicy::NonStrMulti)
    }

    fn key_value(&self) -> Option<KeyValue> {
        Some(KeyValue::Time(self.next_attempt_time.as_filetime_units()))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sender": self.sender,
            "mailboxes": self.mailboxes.iter().map(mailbox_to_json).collect::<Vec<_>>(),
            "content": self.content,
            "status": self.status.as_str(),
            "attempts": self.attempts,
            "next_attempt_time_micros": self.next_attempt_time.as_unix_micros(),
            "retry_schedule_minutes": self.retry_schedule_minutes,
            "tls_requirement": self.tls_requirement.as_str(),
            "sender_computer_name": self.sender_computer_name,
            "base_send_seconds_max": self.base_send_seconds_max,
            "min_send_bytes_per_sec": self.min_send_bytes_per_sec,
            "tls_achieved": self.tls_achieved.map(|t| t.as_str()),
        })
    }

    fn from_json(value: serde_json::Value) -> Result<Self> {
        let mailboxes = value["mailboxes"]
            .as_array()
            .ok_or_else(|| err("SmtpMsgToSend: missing mailboxes"))?
            .iter()
            .map(mailbox_from_json)
            .collect::<Result<Vec<_>>>()?;
        let content = value["content"]
            .as_array()
            .ok_or_else(|| err("SmtpMsgToSend: missing content"))?
            .iter()
            .map(|b| b.as_u64().map(|n| n as u8).ok_or_else(|| err("SmtpMsgToSend: bad content byte")))
            .collect::<Result<Vec<_>>>()?;
        Ok(SmtpMsgToSend {
            sender: value["sender"].as_str().ok_or_else(|| err("SmtpMsgToSend: missing sender"))?.to_string(),
            mailboxes,
            content,
            status: MsgStatus::parse(value["status"].as_str().unwrap_or_default()).ok_or_else(|| err("SmtpMsgToSend: bad status"))?,
            attempts: value["attempts"].as_u64().unwrap_or_default() as u32,
            next_attempt_time: Time::from_unix_micros(value["next_attempt_time_micros"].as_i64().ok_or_else(|| err("SmtpMsgToSend: missing next_attempt_time_micros"))?),
            retry_schedule_minutes: value["retry_schedule_minutes"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_else(|| DEFAULT_RETRY_SCHEDULE_MINUTES.to_vec()),
            tls_requirement: TlsAssurance::parse(value["tls_requirement"].as_str().unwrap_or_default()).ok_or_else(|| err("SmtpMsgToSend: bad tls_requirement"))?,
            sender_computer_name: value["sender_computer_name"].as_str().unwrap_or_default().to_string(),
            base_send_seconds_max: value["base_send_seconds_max"].as_u64().unwrap_or(300) as u32,
            min_send_bytes_per_sec: value["min_send_bytes_per_sec"].as_u64().unwrap_or(1000) as u32,
            tls_achieved: value["tls_achieved"].as_str().and_then(TlsAssurance::parse),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_round_trips() {
        let msg = SmtpMsgToSend::new("a@example.com", vec!["b@example.com".to_string()], b"Hi".to_vec(), "mail01", Time::from_unix_micros(0));
        let json = msg.to_json();
        let back = SmtpMsgToSend::from_json(json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn retry_cadence_matches_schedule() {
        let mut msg = SmtpMsgToSend::new("a@example.com", vec!["b@example.com".to_string()], b"Hi".to_vec(), "mail01", Time::from_unix_micros(0));
        let mut now = Time::from_unix_micros(0);
        for &delay in DEFAULT_RETRY_SCHEDULE_MINUTES {
            let outcomes = vec![(0, MailboxState::Pending)];
            msg.apply_attempt_outcome(outcomes, now);
            assert_eq!(msg.status, MsgStatus::Idle);
            assert_eq!((msg.next_attempt_time - now).as_minutes(), delay);
            now = msg.next_attempt_time;
        }
        msg.apply_attempt_outcome(vec![(0, MailboxState::Pending)], now);
        assert_eq!(msg.status, MsgStatus::FinalPermFail);
    }

    #[test]
    fn all_accepted_settles_success() {
        let mut msg = SmtpMsgToSend::new("a@example.com", vec!["b@example.com".to_string(), "c@example.com".to_string()], b"Hi".to_vec(), "mail01", Time::from_unix_micros(0));
        msg.apply_attempt_outcome(vec![(0, MailboxState::Accepted), (1, MailboxState::Accepted)], Time::from_unix_micros(0));
        assert_eq!(msg.status, MsgStatus::FinalSuccess);
    }

    #[test]
    fn mixed_outcome_settles_partial_fail() {
        let mut msg = SmtpMsgToSend::new("a@example.com", vec!["b@example.com".to_string(), "c@example.com".to_string()], b"Hi".to_vec(), "mail01", Time::from_unix_micros(0));
        let rejection = MailboxState::Rejected(FailureRecord::new(Stage::RcptTo, ErrorClass::ReplyPerm, Some(550), Some("5.1.1".to_string()), vec!["User unknown".to_string()]));
        msg.apply_attempt_outcome(vec![(0, MailboxState::Accepted), (1, rejection)], Time::from_unix_micros(0));
        assert_eq!(msg.status, MsgStatus::FinalPartialFail);
    }
}
