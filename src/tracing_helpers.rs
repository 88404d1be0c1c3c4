//! Zero-cost tracing helpers.
//!
//! With the `tracing` feature enabled these macros forward to the `tracing`
//! crate; without it (the default) they compile to nothing. The call sites
//! are all on slow paths (reclamation scans, index-linkage aborts, height
//! growth), never on the per-node traversal path.
//!
//! ```bash
//! # Normal build - no tracing overhead
//! cargo build --release
//!
//! # Run a stress test with scan-level logging
//! RUST_LOG=skipmap=debug cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level logging. Compiles to a no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging. Compiles to a no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
