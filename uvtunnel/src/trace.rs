//! Logging for the tunnel runtime.
//!
//! Built on `tracing` behind the `tracing` feature (enabled by default). With the
//! feature disabled every log macro expands to nothing.

/// Default filter directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "uvtunnel=info";

/// Install the global subscriber with the default filter.
///
/// Call once at the start of a binary or test. Does nothing if the `tracing`
/// feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    init_tracing_with(DEFAULT_FILTER);
}

/// Install the global subscriber, falling back to `default_directive` when
/// `RUST_LOG` is unset or invalid.
///
/// A second call is ignored rather than panicking.
#[cfg(feature = "tracing")]
pub fn init_tracing_with(default_directive: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing_with(_default_directive: &str) {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
