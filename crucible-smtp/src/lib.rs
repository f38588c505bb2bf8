//! A durable SMTP send queue: a `SmtpMsgToSend` entity ([`schema`]) stored and retried through
//! `crucible-store`, a worker pool ([`service`]) that pumps due messages off a bounded queue
//! ([`queue`]) and runs each through a connect/EHLO/STARTTLS/AUTH/MAIL/RCPT/DATA state machine
//! ([`attempt`]) built on MX resolution ([`resolve`]), TLS upgrade and pinning ([`tls`]), and AUTH
//! mechanism encoding ([`auth`]). [`config`] parses the relay/direct-delivery configuration
//! envelope.
//!
//! [`queue::WorkQueue`] is a `VecDeque`-of-pending-work-behind-a-`Mutex` -- the same shape
//! `naia`'s per-entity command senders (`shared/src/world/entity/entity_message_sender.rs`) use to
//! hold outgoing work until a pump collects it, generalized here from per-entity command batches to
//! due-SMTP-attempts with a dedicated pump thread.

pub mod attempt;
pub mod auth;
pub mod config;
pub mod queue;
pub mod resolve;
pub mod schema;
pub mod service;
pub mod tls;

pub use attempt::{attempt_message, AttemptOutcome};
pub use config::{AuthType, RelayConfig, SendConfig};
pub use queue::{WorkItem, WorkQueue};
pub use resolve::{IpVerPref, MxHost, MxResolver};
pub use schema::{ErrorClass, FailureRecord, Mailbox, MailboxState, MsgStatus, SmtpMsgToSend, Stage, TlsAssurance, KIND_SMTP_MSG_TO_SEND};
pub use service::{enqueue, NullObserver, SendObserver, Service, ServiceConfig};
pub use tls::{starttls_upgrade, InMemoryPinStore, PinStore, TlsUpgrade};
