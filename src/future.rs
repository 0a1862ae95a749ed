//! Deferred values produced by operations.
//!
//! A [`FutureValue`] is a write-once slot paired with a readiness event.
//! Operations complete futures when they finish executing; consumers
//! either block on [`FutureValue::get`] (application threads) or
//! subscribe to the readiness event (pipeline internals). A
//! [`FutureMap`] collects the per-point futures of a must-epoch launch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, UserEvent};

#[derive(Debug)]
struct FutureState {
    result: Option<Result<Vec<u8>>>,
}

/// A write-once deferred value.
#[derive(Clone, Debug)]
pub struct FutureValue {
    state: Arc<Mutex<FutureState>>,
    ready: UserEvent,
}

impl FutureValue {
    /// Creates an empty future, to be completed by its producer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FutureState { result: None })),
            ready: UserEvent::new(),
        }
    }

    /// Creates a future that is already complete with the given bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let future = Self::new();
        future.complete(bytes.into());
        future
    }

    /// Creates a future already complete with a boolean payload.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        Self::from_bytes([u8::from(value)])
    }

    fn lock(&self) -> MutexGuard<'_, FutureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes the future with a payload. Later completions are ignored.
    pub fn complete(&self, bytes: Vec<u8>) {
        {
            let mut state = self.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(Ok(bytes));
        }
        self.ready.trigger();
    }

    /// Completes the future with no payload.
    pub fn complete_empty(&self) {
        self.complete(Vec::new());
    }

    /// Poisons the future with an error. Later completions are ignored.
    pub fn poison(&self, error: Error) {
        {
            let mut state = self.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(Err(error));
        }
        self.ready.trigger();
    }

    /// Returns the readiness event.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.ready.event()
    }

    /// Returns true once the producer has completed or poisoned the future.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().result.is_some()
    }

    /// Returns the payload without blocking, or `None` if not ready.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<Vec<u8>>> {
        self.lock().result.clone()
    }

    /// Blocks until the future is ready and returns its payload.
    pub fn get(&self) -> Result<Vec<u8>> {
        self.ready_event().wait();
        self.lock()
            .result
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::FutureUnresolved))?
    }

    /// Blocks until ready and interprets the payload as a boolean
    /// (first byte non-zero; an empty payload reads as `false`).
    pub fn get_bool(&self) -> Result<bool> {
        let bytes = self.get()?;
        Ok(bytes.first().copied().unwrap_or(0) != 0)
    }
}

impl Default for FutureValue {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-point results of a must-epoch launch.
#[derive(Clone, Debug)]
pub struct FutureMap {
    futures: Arc<BTreeMap<usize, FutureValue>>,
}

impl FutureMap {
    /// Creates a map with one empty future per point in `0..points`.
    #[must_use]
    pub fn new(points: usize) -> Self {
        Self::from_futures((0..points).map(|_| FutureValue::new()).collect())
    }

    /// Wraps existing futures, indexed by position.
    #[must_use]
    pub fn from_futures(futures: Vec<FutureValue>) -> Self {
        Self {
            futures: Arc::new(futures.into_iter().enumerate().collect()),
        }
    }

    /// Returns the future for a point.
    #[must_use]
    pub fn future(&self, point: usize) -> Option<FutureValue> {
        self.futures.get(&point).cloned()
    }

    /// Returns the number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Returns true if the map has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// An event that fires once every point's future is ready.
    #[must_use]
    pub fn all_ready_event(&self) -> Event {
        Event::merge(self.futures.values().map(FutureValue::ready_event))
    }

    /// Blocks until every point is ready; fails on the first poisoned point.
    pub fn wait_all_results(&self) -> Result<()> {
        for future in self.futures.values() {
            future.get()?;
        }
        Ok(())
    }

    /// Poisons every unresolved point with the given error.
    pub fn poison_all(&self, error: &Error) {
        for future in self.futures.values() {
            future.poison(error.clone());
        }
    }
}
