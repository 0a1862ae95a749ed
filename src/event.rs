//! Event primitives consumed by the operation pipeline.
//!
//! An [`Event`] is a one-shot trigger: it either has fired or it has not,
//! and once fired it stays fired. Events can be waited on (blocking the
//! calling thread), subscribed to (running a callback when the event
//! fires), and merged (producing an event that fires once all inputs
//! have). A [`UserEvent`] is an event the owner triggers explicitly.
//!
//! # Waiting
//!
//! `wait` blocks the calling thread and must never be called while an
//! operation lock is held; pipeline-internal consumers use `subscribe`
//! instead, which defers work to the triggering thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EventState {
    triggered: bool,
    callbacks: Vec<Callback>,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventInner {
    fn new() -> Self {
        Self {
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger(&self) {
        let callbacks = {
            let mut state = self.lock();
            if state.triggered {
                return;
            }
            state.triggered = true;
            std::mem::take(&mut state.callbacks)
        };
        self.cond.notify_all();
        for callback in callbacks {
            callback();
        }
    }
}

/// A one-shot trigger in the event graph.
///
/// The cheap default is the "no event" value, which counts as already
/// triggered; merged and user events carry shared state.
#[derive(Clone)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    /// The "no event" value: always triggered, waits return immediately.
    #[must_use]
    pub const fn none() -> Self {
        Self { inner: None }
    }

    /// Returns true if this is a real event rather than the no-event value.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns true once the event has fired.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.lock().triggered,
        }
    }

    /// Blocks the calling thread until the event fires.
    pub fn wait(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut state = inner.lock();
        while !state.triggered {
            state = inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Runs `callback` when the event fires.
    ///
    /// If the event has already fired the callback runs immediately on
    /// the calling thread; otherwise it runs on the triggering thread.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        match &self.inner {
            None => callback(),
            Some(inner) => {
                let mut state = inner.lock();
                if state.triggered {
                    drop(state);
                    callback();
                } else {
                    state.callbacks.push(Box::new(callback));
                }
            }
        }
    }

    /// Merges a set of events into one that fires when all inputs have.
    #[must_use]
    pub fn merge(events: impl IntoIterator<Item = Event>) -> Event {
        let pending: Vec<Event> = events.into_iter().filter(Event::exists).collect();
        if pending.is_empty() {
            return Event::none();
        }
        let merged = UserEvent::new();
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        for event in pending {
            let merged = merged.clone();
            let remaining = Arc::clone(&remaining);
            event.subscribe(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    merged.trigger();
                }
            });
        }
        merged.event()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => write!(f, "Event(none)"),
            Some(inner) => write!(f, "Event(triggered={})", inner.lock().triggered),
        }
    }
}

/// An event triggered explicitly by its owner.
#[derive(Clone)]
pub struct UserEvent {
    inner: Arc<EventInner>,
}

impl UserEvent {
    /// Creates a new untriggered user event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner::new()),
        }
    }

    /// Fires the event, waking waiters and running subscribed callbacks.
    ///
    /// Triggering twice is a no-op.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    /// Returns the waitable view of this event.
    #[must_use]
    pub fn event(&self) -> Event {
        Event {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Returns true once the event has fired.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.inner.lock().triggered
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserEvent(triggered={})", self.has_triggered())
    }
}
