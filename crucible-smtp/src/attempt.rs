//! The per-connection attempt state machine: `Resolve -> Connect -> Greet/EHLO -> STARTTLS ->
//! Auth -> MAIL FROM -> RCPT TO -> DATA -> QUIT`. One call to [`attempt_message`] tries to
//! deliver to every still-pending mailbox of one message, grouped by destination (the
//! configured relay if any, otherwise one connection per recipient domain's MX set), and folds
//! each mailbox into `Accepted`/`Rejected`/left `Pending` for the caller to persist.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::{Duration as StdDuration, Instant};

use crucible_base::{transient, Result};
use crucible_parse::smtp::{dot_stuff, ehlo_command, mail_from_command, parse_ehlo_capabilities, parse_reply, rcpt_to_command, EhloCapabilities, Reply};
use rustls::StreamOwned;

use crate::auth::{cram_md5_response, login_password, login_username, plain_response};
use crate::config::{AuthType, RelayConfig, SendConfig};
use crate::resolve::{mx_connect_order, IpVerPref, MxResolver};
use crate::schema::{ErrorClass, FailureRecord, Mailbox, MailboxState, SmtpMsgToSend, Stage};
use crate::tls::{starttls_upgrade, PinStore};

pub struct AttemptOutcome {
    pub mailbox_outcomes: Vec<(usize, MailboxState)>,
    pub tls_achieved: Option<crate::schema::TlsAssurance>,
}

/// A failure scoped to every mailbox in the group the connection attempt was serving, because
/// it happened before per-recipient `RCPT TO` results could differ (connect/EHLO/TLS/auth
/// failures, or a `MAIL FROM` rejection).
struct GroupFailure {
    record: FailureRecord,
}

enum Conn {
    Plain(TcpStream),
    Tls(Box<StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.read(buf),
            Conn::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.write(buf),
            Conn::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Conn::Plain(s) => s.flush(),
            Conn::Tls(s) => s.flush(),
        }
    }
}

struct Session {
    reader: BufReader<Conn>,
}

impl Session {
    fn new(conn: Conn) -> Session {
        Session { reader: BufReader::new(conn) }
    }

    fn send(&mut self, line: &str) -> std::result::Result<(), GroupFailure> {
        self.reader
            .get_mut()
            .write_all(line.as_bytes())
            .map_err(|e| network_failure(Stage::Connect, e))
    }

    fn read_reply(&mut self, stage: Stage) -> std::result::Result<Reply, GroupFailure> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).map_err(|e| network_failure(stage, e))?;
            if n == 0 {
                return Err(GroupFailure {
                    record: FailureRecord::new(stage, ErrorClass::Network, None, None, vec!["connection closed".to_string()]),
                });
            }
            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
            let is_last = trimmed.as_bytes().get(3) != Some(&b'-');
            lines.push(trimmed);
            if is_last {
                break;
            }
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        parse_reply(&refs).ok_or_else(|| GroupFailure {
            record: FailureRecord::new(stage, ErrorClass::Internal, None, None, vec!["unparseable reply".to_string()]),
        })
    }

    fn command(&mut self, stage: Stage, line: &str) -> std::result::Result<Reply, GroupFailure> {
        self.send(line)?;
        self.read_reply(stage)
    }

    fn expect_positive(&mut self, stage: Stage, line: &str) -> std::result::Result<Reply, GroupFailure> {
        let reply = self.command(stage, line)?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(reply_failure(stage, &reply))
        }
    }
}

fn network_failure(stage: Stage, e: std::io::Error) -> GroupFailure {
    let class = if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
        ErrorClass::Timeout
    } else {
        ErrorClass::Network
    };
    GroupFailure {
        record: FailureRecord::new(stage, class, None, None, vec![e.to_string()]),
    }
}

fn reply_failure(stage: Stage, reply: &Reply) -> GroupFailure {
    let class = if reply.is_permanent() { ErrorClass::ReplyPerm } else { ErrorClass::ReplyTemp };
    GroupFailure {
        record: FailureRecord::new(stage, class, Some(reply.code), reply.enhanced_status.clone(), reply.lines.clone()),
    }
}

fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

/// Groups pending mailbox indices by the connection that will carry them: a single group for
/// every recipient when a relay is configured, otherwise one group per recipient domain.
fn group_pending_mailboxes(msg: &SmtpMsgToSend, relay: Option<&RelayConfig>) -> Vec<(String, Vec<usize>)> {
    if relay.is_some() {
        let all: Vec<usize> = msg
            .mailboxes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.state == MailboxState::Pending)
            .map(|(i, _)| i)
            .collect();
        return if all.is_empty() { Vec::new() } else { vec![("relay".to_string(), all)] };
    }
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, mailbox) in msg.mailboxes.iter().enumerate() {
        if mailbox.state != MailboxState::Pending {
            continue;
        }
        let Some(domain) = domain_of(&mailbox.address) else { continue };
        match groups.iter_mut().find(|(d, _)| d == domain) {
            Some((_, idxs)) => idxs.push(i),
            None => groups.push((domain.to_string(), vec![i])),
        }
    }
    groups
}

fn connect_tcp(host: &str, port: u16, resolver: &MxResolver, ip_pref: IpVerPref) -> std::result::Result<TcpStream, GroupFailure> {
    let addr = resolver.resolve_addr(host, ip_pref).map_err(|e| GroupFailure {
        record: FailureRecord::new(Stage::Connect, ErrorClass::Network, None, None, vec![e.to_string()]),
    })?;
    TcpStream::connect((addr, port)).map_err(|e| network_failure(Stage::Connect, e))
}

/// Tries each MX host (round-robin within a preference tier) until one connects.
fn connect_any_mx(domain: &str, resolver: &MxResolver, ip_pref: IpVerPref) -> std::result::Result<TcpStream, GroupFailure> {
    let hosts = resolver.resolve_mx(domain).map_err(|e| GroupFailure {
        record: FailureRecord::new(Stage::Connect, ErrorClass::Network, None, None, vec![e.to_string()]),
    })?;
    let mut last_err = None;
    for mx in mx_connect_order(&hosts, 0) {
        match connect_tcp(&mx.host, 25, resolver, ip_pref) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(GroupFailure {
        record: FailureRecord::new(Stage::Connect, ErrorClass::Network, None, None, vec!["no MX hosts".to_string()]),
    }))
}

fn maybe_starttls(
    session: Session,
    tcp_for_tls: TcpStream,
    domain: &str,
    requirement: crate::schema::TlsAssurance,
    caps: &EhloCapabilities,
    pins: &dyn PinStore,
) -> std::result::Result<(Session, Option<crate::schema::TlsAssurance>), GroupFailure> {
    let must_tls = requirement > crate::schema::TlsAssurance::None;
    if !caps.starttls {
        return if must_tls {
            Err(GroupFailure {
                record: FailureRecord::new(Stage::Tls, ErrorClass::TlsRequired, None, None, vec!["server does not advertise STARTTLS".to_string()]),
            })
        } else {
            Ok((session, None))
        };
    }
    let mut session = session;
    session.expect_positive(Stage::Tls, "STARTTLS\r\n")?;
    let upgrade = starttls_upgrade(tcp_for_tls, domain, requirement, pins).map_err(|e| GroupFailure {
        record: FailureRecord::new(Stage::Tls, ErrorClass::TlsFailed, None, None, vec![e.to_string()]),
    })?;
    if upgrade.assurance < requirement {
        return Err(GroupFailure {
            record: FailureRecord::new(Stage::Tls, ErrorClass::TlsRequired, None, None, vec![format!("achieved {:?}, required {:?}", upgrade.assurance, requirement)]),
        });
    }
    Ok((Session::new(Conn::Tls(Box::new(upgrade.stream))), Some(upgrade.assurance)))
}

fn maybe_auth(session: &mut Session, relay: &RelayConfig) -> std::result::Result<(), GroupFailure> {
    if relay.username.is_empty() {
        return Ok(());
    }
    match relay.auth_type {
        AuthType::Login => {
            session.expect_positive(Stage::Auth, "AUTH LOGIN\r\n")?;
            session.expect_positive(Stage::Auth, &format!("{}\r\n", login_username(&relay.username)))?;
            session.expect_positive(Stage::Auth, &format!("{}\r\n", login_password(&relay.password)))?;
        }
        AuthType::Plain => {
            let response = plain_response(&relay.username, &relay.password);
            session.expect_positive(Stage::Auth, &format!("AUTH PLAIN {response}\r\n"))?;
        }
        AuthType::CramMd5 => {
            let reply = session.command(Stage::Auth, "AUTH CRAM-MD5\r\n")?;
            let challenge = reply.lines.first().cloned().unwrap_or_default();
            let response = cram_md5_response(&relay.username, &relay.password, &challenge).ok_or_else(|| GroupFailure {
                record: FailureRecord::new(Stage::Auth, ErrorClass::Internal, None, None, vec!["bad CRAM-MD5 challenge".to_string()]),
            })?;
            session.expect_positive(Stage::Auth, &format!("{response}\r\n"))?;
        }
    }
    Ok(())
}

/// Streams `content` during DATA, aborting with `TooSlow` if the sustained rate drops below
/// `min_bytes_per_sec` past the first second, or with `Timeout` once `deadline` passes.
fn send_data(session: &mut Session, content: &[u8], min_bytes_per_sec: u32, deadline: Instant) -> std::result::Result<(), GroupFailure> {
    let stuffed = dot_stuff(content);
    let started = Instant::now();
    let chunk_size = 16 * 1024;
    let mut sent = 0usize;
    for chunk in stuffed.chunks(chunk_size) {
        if Instant::now() > deadline {
            return Err(GroupFailure {
                record: FailureRecord::new(Stage::Data, ErrorClass::Timeout, None, None, vec!["DATA deadline exceeded".to_string()]),
            });
        }
        session
            .reader
            .get_mut()
            .write_all(chunk)
            .map_err(|e| network_failure(Stage::Data, e))?;
        sent += chunk.len();
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 1.0 && (sent as f64 / elapsed) < min_bytes_per_sec as f64 {
            return Err(GroupFailure {
                record: FailureRecord::new(Stage::Data, ErrorClass::TooSlow, None, None, vec![format!("{:.0} bytes/sec", sent as f64 / elapsed)]),
            });
        }
    }
    Ok(())
}

/// Runs one connection's worth of the state machine for `indices` (mailbox indices sharing this
/// group), returning each mailbox's outcome and the TLS assurance achieved (if any).
fn attempt_group(msg: &SmtpMsgToSend, indices: &[usize], connect_target: &str, config: &SendConfig, relay: Option<&RelayConfig>, resolver: &MxResolver, pins: &dyn PinStore) -> (Vec<(usize, MailboxState)>, Option<crate::schema::TlsAssurance>) {
    let result = attempt_group_inner(msg, indices, connect_target, config, relay, resolver, pins);
    match result {
        Ok((accepted, rejected, tls)) => {
            let mut outcomes = Vec::with_capacity(indices.len());
            for &i in indices {
                let state = if rejected.iter().any(|(ri, _)| *ri == i) {
                    rejected.iter().find(|(ri, _)| *ri == i).unwrap().1.clone()
                } else if accepted.contains(&i) {
                    MailboxState::Accepted
                } else {
                    MailboxState::Pending
                };
                outcomes.push((i, state));
            }
            (outcomes, tls)
        }
        Err(failure) => {
            let outcomes = indices.iter().map(|&i| (i, MailboxState::Rejected(failure.record.clone()))).collect();
            (outcomes, None)
        }
    }
}

#[allow(clippy::type_complexity)]
fn attempt_group_inner(
    msg: &SmtpMsgToSend,
    indices: &[usize],
    connect_target: &str,
    config: &SendConfig,
    relay: Option<&RelayConfig>,
    resolver: &MxResolver,
    pins: &dyn PinStore,
) -> std::result::Result<(Vec<usize>, Vec<(usize, MailboxState)>, Option<crate::schema::TlsAssurance>), GroupFailure> {
    let deadline = Instant::now() + StdDuration::from_secs(msg.base_send_seconds_max as u64);

    let tcp = match relay {
        Some(r) => connect_tcp(&r.host, r.port, resolver, config.ip_ver_pref)?,
        None => connect_any_mx(connect_target, resolver, config.ip_ver_pref)?,
    };
    tcp.set_read_timeout(Some(StdDuration::from_secs(msg.base_send_seconds_max as u64))).ok();
    tcp.set_write_timeout(Some(StdDuration::from_secs(msg.base_send_seconds_max as u64))).ok();
    let tcp_for_tls = tcp.try_clone().map_err(|e| network_failure(Stage::Connect, e))?;

    let mut session = Session::new(Conn::Plain(tcp));
    session.read_reply(Stage::Connect)?; // greeting

    let ehlo_reply = session.expect_positive(Stage::Ehlo, &ehlo_command(&msg.sender_computer_name))?;
    let caps = parse_ehlo_capabilities(&ehlo_reply);

    let tls_requirement = relay.map(|r| r.tls_requirement).unwrap_or(msg.tls_requirement);
    let (mut session, tls_achieved) = if relay.map(|r| r.implicit_tls).unwrap_or(false) {
        (session, None) // implicit TLS would need to wrap before EHLO; left for a relay-specific connector.
    } else {
        maybe_starttls(session, tcp_for_tls, connect_target, tls_requirement, &caps, pins)?
    };

    if let Some(relay) = relay {
        maybe_auth(&mut session, relay)?;
    }

    let size_hint = if caps.size.is_some() { Some(msg.content.len() as u64) } else { None };
    session.expect_positive(Stage::MailFrom, &mail_from_command(&msg.sender, size_hint, caps.eightbitmime))?;

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for &i in indices {
        let mailbox: &Mailbox = &msg.mailboxes[i];
        match session.command(Stage::RcptTo, &rcpt_to_command(&mailbox.address)) {
            Ok(reply) if reply.is_positive() => accepted.push(i),
            Ok(reply) => rejected.push((i, MailboxState::Rejected(reply_failure(Stage::RcptTo, &reply).record))),
            Err(failure) => rejected.push((i, MailboxState::Rejected(failure.record))),
        }
    }

    if !accepted.is_empty() {
        session.expect_positive(Stage::Data, "DATA\r\n")?;
        send_data(&mut session, &msg.content, msg.min_send_bytes_per_sec, deadline)?;
        let reply = session.read_reply(Stage::Data)?;
        if !reply.is_positive() {
            return Err(reply_failure(Stage::Data, &reply));
        }
    }

    let _ = session.command(Stage::Quit, "QUIT\r\n"); // best-effort

    Ok((accepted, rejected, tls_achieved))
}

/// Attempts delivery of every pending mailbox on `msg`, one connection per destination group.
pub fn attempt_message(msg: &SmtpMsgToSend, config: &SendConfig, resolver: &MxResolver, pins: &dyn PinStore) -> Result<AttemptOutcome> {
    let groups = group_pending_mailboxes(msg, config.relay.as_ref());
    if groups.is_empty() {
        return Ok(AttemptOutcome { mailbox_outcomes: Vec::new(), tls_achieved: None });
    }
    let mut outcomes = Vec::new();
    let mut best_tls = None;
    for (target, indices) in groups {
        let (group_outcomes, tls) = attempt_group(msg, &indices, &target, config, config.relay.as_ref(), resolver, pins);
        outcomes.extend(group_outcomes);
        if tls.is_some() {
            best_tls = tls;
        }
    }
    Ok(AttemptOutcome { mailbox_outcomes: outcomes, tls_achieved: best_tls })
}

/// `connect_any_mx`/`connect_tcp` fail closed rather than silently succeeding without a
/// resolver; this surfaces a `Transient` error for callers outside the per-mailbox path (e.g. a
/// relay host that can't be resolved at all).
pub fn require_connectable(config: &SendConfig) -> Result<()> {
    if let Some(relay) = &config.relay {
        if relay.host.is_empty() {
            return Err(transient("relay configured with empty host"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_base::Time;

    #[test]
    fn groups_by_domain_without_relay() {
        let msg = SmtpMsgToSend::new(
            "a@example.com",
            vec!["b@one.com".to_string(), "c@two.com".to_string(), "d@one.com".to_string()],
            b"hi".to_vec(),
            "mail01",
            Time::from_unix_micros(0),
        );
        let groups = group_pending_mailboxes(&msg, None);
        assert_eq!(groups.len(), 2);
        let one = groups.iter().find(|(d, _)| d == "one.com").unwrap();
        assert_eq!(one.1.len(), 2);
    }

    #[test]
    fn groups_as_single_relay_target() {
        let relay = RelayConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            implicit_tls: false,
            tls_requirement: crate::schema::TlsAssurance::Unverified,
            auth_type: AuthType::Plain,
            username: String::new(),
            password: String::new(),
        };
        let msg = SmtpMsgToSend::new(
            "a@example.com",
            vec!["b@one.com".to_string(), "c@two.com".to_string()],
            b"hi".to_vec(),
            "mail01",
            Time::from_unix_micros(0),
        );
        let groups = group_pending_mailboxes(&msg, Some(&relay));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }
}
