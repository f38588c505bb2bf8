// Contract violations internal to the core are not recoverable errors: they're panics
// carrying enough context to find the violated invariant, not a returned `Error`. This
// macro is the one place that translates a failed condition into that panic,
// logging first so the failure is visible in structured logs even if the panic is caught by
// a thread boundary and turned into a generic "worker died" message upstream.

#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            let msg = format!($($arg)+);
            tracing::error!(target: "crucible", "invariant violated at {}:{}: {}", file!(), line!(), msg);
            panic!("invariant violated: {}", msg);
        }
    };
}
