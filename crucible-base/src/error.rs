// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A small taxonomy (ErrorKind) so callers can distinguish "malformed input", "lookup miss",
//    "retry me" and "don't retry me" without downcasting.

use std::borrow::Cow;
use std::fmt;

use tracing::error;

#[cfg(test)]
use test_log::test;

/// Error taxonomy. `Invariant` is special: a violated invariant should be raised via
/// [`crate::invariant!`], which panics, not via a returned `Error` of this kind. The kind still
/// exists so that a caught panic payload or a boundary translation layer can tag it consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Invariant,
    Input,
    NotFound,
    Conflict,
    Transient,
    Permanent,
    Cancelled,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {:?}", self.kind, self.inner)
    }
}

struct SimpleErr(Cow<'static, str>);
impl fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::with_kind(ErrorKind::Input, err)
    }
}

impl Error {
    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(
        kind: ErrorKind,
        err: E,
    ) -> Error {
        error!(target: "crucible", ?kind, "{:?}", err);
        let inner = anyhow::Error::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Build an `Input`-kind error from a message. This is the general-purpose constructor; most
/// call sites that aren't explicitly reporting a lookup miss, conflict, or retry classification
/// want this one.
pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Input, msg)
}

pub fn err_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let simple = SimpleErr(msg.into());
    Error::with_kind(kind, simple)
}

pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::NotFound, msg)
}

pub fn conflict(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Conflict, msg)
}

pub fn transient(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Transient, msg)
}

pub fn permanent(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Permanent, msg)
}

pub fn cancelled(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Cancelled, msg)
}

#[test]
fn test_error() {
    let e = err("test error");
    assert_eq!(e.kind(), ErrorKind::Input);
    let e = transient("timed out");
    assert!(e.is_transient());
}
