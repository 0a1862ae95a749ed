//! Runtime configuration.
//!
//! [`RuntimeConfig`] controls the shape of the runtime: how many analysis
//! workers drive the ready queue, how many processors the default mapper
//! can target, and whether deferred triggers run inline on the issuing
//! thread (useful for deterministic tests).

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Configuration for [`Runtime`](crate::runtime::Runtime) construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of analysis worker threads servicing the ready queue.
    pub worker_threads: usize,
    /// Number of processors the mapper can target.
    pub processors: usize,
    /// Run deferred triggers inline on the thread that schedules them.
    ///
    /// Inline execution is single-threaded and deterministic; it is the
    /// mode the unit tests use. Callers must not schedule work while
    /// holding an operation lock when this is enabled.
    pub inline_execution: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            processors: 4,
            inline_execution: false,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a deterministic single-threaded configuration for tests.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            worker_threads: 0,
            processors: 4,
            inline_execution: true,
        }
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Sets the number of processors.
    #[must_use]
    pub fn with_processors(mut self, processors: usize) -> Self {
        self.processors = processors;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.processors == 0 {
            return Err(Error::new(ErrorKind::Config).with_context("processors must be non-zero"));
        }
        if !self.inline_execution && self.worker_threads == 0 {
            return Err(Error::new(ErrorKind::Config)
                .with_context("worker_threads must be non-zero unless inline_execution is set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RuntimeConfig::default().validate().expect("valid");
    }

    #[test]
    fn inline_is_valid_without_workers() {
        let config = RuntimeConfig::inline();
        assert_eq!(config.worker_threads, 0);
        config.validate().expect("valid");
    }

    #[test]
    fn zero_processors_rejected() {
        let config = RuntimeConfig::default().with_processors(0);
        let err = config.validate().expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn zero_workers_rejected_when_threaded() {
        let config = RuntimeConfig::default().with_worker_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let config = RuntimeConfig::default().with_worker_threads(3);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: RuntimeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn serde_defaults_missing_fields() {
        let back: RuntimeConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(back, RuntimeConfig::default());
    }
}
