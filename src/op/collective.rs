//! Dynamic collective operations.
//!
//! A dynamic collective gathers contributions from many arrivals and
//! combines them into one value. The operation defers the read: it
//! completes a future once the collective's arrival barrier has
//! triggered, memoizing the combined result so it can be consumed like
//! any other future.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::TaskContext;
use crate::event::UserEvent;
use crate::future::FutureValue;
use crate::op::{OpCore, OpKind, Operation};
use crate::runtime::Runtime;

type CombineFn = Arc<dyn Fn(&[Vec<u8>]) -> Vec<u8> + Send + Sync>;

struct CollectiveState {
    expected: usize,
    arrivals: Vec<Vec<u8>>,
}

struct CollectiveInner {
    state: Mutex<CollectiveState>,
    done: UserEvent,
    combine: CombineFn,
}

/// A barrier-like value source: `expected` arrivals, each carrying a
/// payload, combined once everyone has arrived.
#[derive(Clone)]
pub struct DynamicCollective {
    inner: Arc<CollectiveInner>,
}

impl DynamicCollective {
    /// Creates a collective expecting the given number of arrivals,
    /// combining payloads by concatenation.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self::with_combiner(expected, |arrivals| arrivals.concat())
    }

    /// Creates a collective with a custom combiner.
    #[must_use]
    pub fn with_combiner(
        expected: usize,
        combine: impl Fn(&[Vec<u8>]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(CollectiveInner {
                state: Mutex::new(CollectiveState {
                    expected,
                    arrivals: Vec::new(),
                }),
                done: UserEvent::new(),
                combine: Arc::new(combine),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectiveState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Contributes a payload. The final arrival triggers the barrier.
    pub fn arrive(&self, payload: impl Into<Vec<u8>>) {
        let complete = {
            let mut state = self.lock();
            state.arrivals.push(payload.into());
            state.arrivals.len() >= state.expected
        };
        if complete {
            self.inner.done.trigger();
        }
    }

    /// The number of arrivals still outstanding.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let state = self.lock();
        state.expected.saturating_sub(state.arrivals.len())
    }

    fn combined(&self) -> Vec<u8> {
        let state = self.lock();
        (self.inner.combine)(&state.arrivals)
    }
}

impl std::fmt::Debug for DynamicCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        write!(
            f,
            "DynamicCollective({}/{} arrived)",
            state.arrivals.len(),
            state.expected
        )
    }
}

#[derive(Default)]
struct CollectiveOpData {
    collective: Option<DynamicCollective>,
    future: Option<FutureValue>,
}

/// Reads a dynamic collective's combined value into a future.
pub struct DynamicCollectiveOp {
    core: OpCore,
    state: Mutex<CollectiveOpData>,
}

impl DynamicCollectiveOp {
    pub(crate) fn new(runtime: &Arc<Runtime>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_ref: Weak<dyn Operation> = weak.clone();
            Self {
                core: OpCore::new(Arc::clone(runtime), self_ref),
                state: Mutex::new(CollectiveOpData::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, CollectiveOpData> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn initialize(
        self: &Arc<Self>,
        ctx: &Arc<TaskContext>,
        collective: DynamicCollective,
    ) -> FutureValue {
        let future = FutureValue::new();
        {
            let mut data = self.lock();
            data.collective = Some(collective);
            data.future = Some(future.clone());
        }
        self.core.initialize_operation(ctx, true, 0);
        future
    }
}

impl Operation for DynamicCollectiveOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn kind(&self) -> OpKind {
        OpKind::DynamicCollective
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn trigger_execution(&self) {
        let (collective, future) = {
            let data = self.lock();
            (data.collective.clone(), data.future.clone())
        };
        let (Some(collective), Some(future)) = (collective, future) else {
            self.core.complete_execution();
            return;
        };
        let handle = self.core.handle();
        let runtime = Arc::clone(self.core.runtime());
        let barrier = collective.inner.done.event();
        barrier.subscribe(move || {
            future.complete(collective.combined());
            runtime.defer(move || handle.core().complete_execution());
        });
    }
}
