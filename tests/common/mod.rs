#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use opstream::{Runtime, RuntimeConfig};
use proptest::prelude::ProptestConfig;

static INIT_LOGGING: Once = Once::new();

/// Installs a tracing subscriber once per test binary. Harmless when the
/// `tracing-integration` feature is off.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Property-test configuration with a bounded case count.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        max_shrink_iters: 1024,
        ..ProptestConfig::default()
    }
}

/// A deterministic single-threaded runtime.
#[must_use]
pub fn inline_runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::inline()).expect("inline runtime")
}

/// A runtime with real analysis workers.
#[must_use]
pub fn threaded_runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::default().with_worker_threads(2).with_processors(4))
        .expect("threaded runtime")
}

/// Polls `predicate` until it holds or the timeout elapses.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A short pause for "must not have happened yet" assertions.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(40));
}
