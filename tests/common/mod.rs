//! Common test utilities: tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g., `skipmap=debug`)
//! - `SKIPMAP_LOG_DIR`: log directory (default: `logs/`)
//! - `SKIPMAP_LOG_CONSOLE`: set to "0" to disable console output
//!
//! Logs are written to `logs/skipmap.ndjson`, one JSON object per line:
//!
//! ```bash
//! cat logs/skipmap.ndjson | jq .
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Create an `EnvFilter` from `RUST_LOG` or fall back to INFO.
fn make_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
}

#[expect(clippy::expect_used, reason = "fail fast when the log sink is unusable")]
fn setup_tracing() {
    let log_dir = env::var("SKIPMAP_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from);
    std::fs::create_dir_all(&log_dir).expect("failed to create log directory");

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("skipmap.ndjson"))
        .expect("failed to create log file");

    let console_layer = if env::var("SKIPMAP_LOG_CONSOLE").is_ok_and(|v| v == "0") {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(true)
                .compact()
                .with_filter(make_filter()),
        )
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_thread_ids(true)
        .with_target(true)
        .json()
        .with_filter(make_filter());

    // try_init so a subscriber installed elsewhere does not panic us.
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
