use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::engine::{
    GraphBuildingContext, ProducerCore, ProducerRef, ResolutionPump, ResolveTask, ResolvedValueCallback,
    ResolvedValueProducer,
};
use crate::failure::ResolutionFailure;
use crate::value::{ResolvedValue, ValueRequirement};

/// Upstream producers that have not reported their last result or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Active(usize),
    /// The aggregate is gone, late reports are ignored.
    Discarded,
}

impl Pending {
    fn increment(&mut self) {
        if let Pending::Active(count) = self {
            *count += 1;
        }
    }

    fn decrement(&mut self) {
        match self {
            Pending::Active(0) => warn!("aggregate pending count already at zero"),
            Pending::Active(count) => *count -= 1,
            Pending::Discarded => {}
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Pending::Active(0))
    }
}

struct AggregateState {
    /// Starts at one, held until every upstream is subscribed.
    pending: Pending,
    /// Upstream handles that can produce another result.
    pumps: VecDeque<ResolutionPump>,
    handles: Vec<ResolutionPump>,
    /// A subscriber asked for a result that has not arrived yet.
    wanted: bool,
    upstreams: usize,
    recursion_reports: usize,
    /// Fresh task to try when every upstream hit a recursion guard.
    fallback: Option<Arc<ResolveTask>>,
    fallback_task: Option<Arc<ResolveTask>>,
    fallback_results: usize,
}

/// Several producers answering the same requirement, seen as one.
///
/// The first result from any of them is passed on, duplicates are dropped and
/// further pumps go round the upstream handles in the order their results
/// arrived.
pub(crate) struct AggregateResolvedValueProducer {
    core: ProducerCore,
    this: Weak<AggregateResolvedValueProducer>,
    state: Mutex<AggregateState>,
}

impl AggregateResolvedValueProducer {
    pub(crate) fn new(requirement: ValueRequirement, fallback: Option<Arc<ResolveTask>>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<AggregateResolvedValueProducer>| Self {
            core: ProducerCore::new(requirement, this.clone()),
            this: this.clone(),
            state: Mutex::new(AggregateState {
                pending: Pending::Active(1),
                pumps: VecDeque::new(),
                handles: Vec::new(),
                wanted: false,
                upstreams: 0,
                recursion_reports: 0,
                fallback,
                fallback_task: None,
                fallback_results: 0,
            }),
        })
    }

    pub(crate) fn add_producer(&self, ctx: &mut GraphBuildingContext, producer: ProducerRef) {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending == Pending::Discarded {
                return;
            }
            state.pending.increment();
            state.upstreams += 1;
        }
        self.subscribe(ctx, &producer, false);
    }

    /// Every upstream is subscribed.
    pub(crate) fn start(&self, ctx: &mut GraphBuildingContext) {
        self.state.lock().unwrap().pending.decrement();
        self.after_upstream_change(ctx);
    }

    fn subscribe(&self, ctx: &mut GraphBuildingContext, producer: &ProducerRef, fallback: bool) {
        let callback = Arc::new(Upstream {
            aggregate: self.this.clone(),
            recursion: AtomicBool::new(false),
            fallback,
        });
        if let Some(handle) = producer.core().add_callback(ctx, callback) {
            let mut state = self.state.lock().unwrap();
            if state.pending == Pending::Discarded {
                drop(state);
                ctx.close(&handle);
            } else {
                state.handles.push(handle);
            }
        }
    }

    fn upstream_resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        upstream: &Upstream,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        let last = {
            let mut state = self.state.lock().unwrap();
            if state.pending == Pending::Discarded {
                drop(state);
                if let Some(pump) = pump {
                    ctx.close(&pump);
                }
                return;
            }
            if pump.is_none() {
                state.pending.decrement();
            }
            pump.is_none() && state.pending.is_zero() && state.pumps.is_empty()
        };

        // Best effort: another upstream may still deliver after `last` was
        // computed, its result then arrives at a finished producer and is
        // dropped.
        if self.core.push_result(ctx, value, last) {
            {
                let mut state = self.state.lock().unwrap();
                state.wanted = false;
                if upstream.fallback {
                    state.fallback_results += 1;
                }
                if let Some(pump) = pump {
                    state.pumps.push_back(pump);
                }
            }
            if last {
                self.conclude(ctx);
            }
            return;
        }

        if self.core.is_discarded() || self.core.is_finished() {
            if let Some(pump) = pump {
                ctx.close(&pump);
            }
            return;
        }
        debug!(producer = self.core.id(), "duplicate result from upstream");
        match pump {
            Some(pump) => ctx.pump(&pump),
            None => self.pump_next(ctx),
        }
    }

    fn upstream_failed(&self, ctx: &mut GraphBuildingContext, upstream: &Upstream, failure: Option<ResolutionFailure>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending == Pending::Discarded {
                return;
            }
            state.pending.decrement();
            if upstream.recursion.load(Ordering::Acquire) {
                state.recursion_reports += 1;
            }
        }
        self.core.store_failure(failure.as_ref());
        self.after_upstream_change(ctx);
    }

    fn after_upstream_change(&self, ctx: &mut GraphBuildingContext) {
        let proceed = {
            let state = self.state.lock().unwrap();
            state.wanted || (state.pending.is_zero() && state.pumps.is_empty())
        };
        if proceed {
            self.pump_next(ctx);
        }
    }

    fn pump_next(&self, ctx: &mut GraphBuildingContext) {
        let mut state = self.state.lock().unwrap();
        if state.pending == Pending::Discarded {
            return;
        }
        if let Some(pump) = state.pumps.pop_front() {
            drop(state);
            ctx.pump(&pump);
        } else if state.pending.is_zero() {
            drop(state);
            self.conclude(ctx);
        }
    }

    /// Every upstream is exhausted: finish, unless a fallback task is due.
    fn conclude(&self, ctx: &mut GraphBuildingContext) {
        let mut state = self.state.lock().unwrap();
        if !state.pending.is_zero() || !state.pumps.is_empty() {
            return;
        }

        let all_recursive = state.upstreams > 0 && state.recursion_reports == state.upstreams;
        if self.core.result_count() == 0
            && all_recursive
            && let Some(fallback) = state.fallback.take()
        {
            state.pending = Pending::Active(1);
            drop(state);
            debug!(requirement = %self.core.requirement(), "every upstream hit recursion, starting fallback");
            let task = ctx.get_or_create_task_resolving(fallback);
            self.state.lock().unwrap().fallback_task = Some(task.clone());
            self.subscribe(ctx, &(task.clone() as ProducerRef), true);
            task.release(ctx);
            return;
        }

        let unused = state.fallback.take();
        let fruitless = if state.fallback_results == 0 {
            state.fallback_task.take()
        } else {
            None
        };
        let recursion = state.recursion_reports > 0;
        drop(state);

        if recursion {
            self.core.set_recursion_detected();
        }
        self.core.finished(ctx);
        if let Some(task) = fruitless {
            debug!(task = task.core().id(), "fallback found nothing new");
            ctx.remove_task(&task);
        }
        if let Some(unused) = unused {
            unused.release(ctx);
        }
    }
}

impl ResolvedValueProducer for AggregateResolvedValueProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn pump_impl(&self, ctx: &mut GraphBuildingContext) {
        self.state.lock().unwrap().wanted = true;
        self.pump_next(ctx);
    }

    fn discard(&self, ctx: &mut GraphBuildingContext) {
        let (handles, unused) = {
            let mut state = self.state.lock().unwrap();
            state.pending = Pending::Discarded;
            state.pumps.clear();
            state.fallback_task = None;
            (std::mem::take(&mut state.handles), state.fallback.take())
        };
        for handle in handles {
            ctx.close(&handle);
        }
        if let Some(unused) = unused {
            unused.release(ctx);
        }
    }
}

/// The aggregate's subscription to one upstream producer.
struct Upstream {
    aggregate: Weak<AggregateResolvedValueProducer>,
    recursion: AtomicBool,
    fallback: bool,
}

impl ResolvedValueCallback for Upstream {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        _: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        match self.aggregate.upgrade() {
            Some(aggregate) => aggregate.upstream_resolved(ctx, self, value, pump),
            None => {
                if let Some(pump) = pump {
                    ctx.close(&pump);
                }
            }
        }
    }

    fn failed(&self, ctx: &mut GraphBuildingContext, _: &ValueRequirement, failure: Option<ResolutionFailure>) {
        if let Some(aggregate) = self.aggregate.upgrade() {
            aggregate.upstream_failed(ctx, self, failure);
        }
    }

    fn recursion_detected(&self) {
        self.recursion.store(true, Ordering::Release);
    }

    fn owner(&self) -> Option<ProducerRef> {
        self.aggregate
            .upgrade()
            .map(|aggregate| aggregate as ProducerRef)
    }
}
