mod error;
mod invariant;
mod time;

pub use error::{cancelled, conflict, err, err_kind, not_found, permanent, transient, Error, ErrorKind, Result};
pub use time::{Duration, Time};
