//! Parser/emitter layer for IMF, MIME, SMTP wire grammar, and DKIM: a small
//! PEG-style combinator framework with best-attempt diagnostics, the codecs it (or simple
//! line-oriented scanners, where that reads more naturally) builds on, and the grammars
//! themselves.

pub mod addr;
pub mod b64;
pub mod base32;
pub mod dkim;
pub mod framework;
pub mod imf;
pub mod mime;
pub mod qp;
pub mod smtp;

pub use addr::AddrSpec;
pub use framework::{BestAttempt, Cursor, Node, NodeKind};
pub use imf::{Field, FieldKind, Message, TraceGroup};
pub use mime::{Content, ContentType, MimePart};
