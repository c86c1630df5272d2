use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::engine::steps::{NextFunctionStep, PumpingStep, TaskState};
use crate::engine::{
    GraphBuildingContext, ProducerRef, ResolutionPump, ResolveTask, ResolvedValueCallback,
};
use crate::failure::ResolutionFailure;
use crate::value::{ResolvedValue, ValueRequirement, ValueSpecification};

/// Where a delegating step stands with the producer it follows.
#[derive(Default)]
enum PumpSlot {
    /// Subscribed, nothing delivered yet.
    #[default]
    Initial,
    /// Waiting for a result after a pump.
    Waiting(ResolutionPump),
    /// A result was delivered, the handle asks for the next.
    Ready(ResolutionPump),
    /// The last result was delivered.
    Exhausted,
    /// The producer failed.
    Closed,
}

impl PumpSlot {
    fn handle(self) -> Option<ResolutionPump> {
        match self {
            PumpSlot::Waiting(pump) | PumpSlot::Ready(pump) => Some(pump),
            _ => None,
        }
    }
}

/// Follows a producer that is already working on the wanted specification.
struct Follower {
    slot: Mutex<PumpSlot>,
}

impl Follower {
    fn new() -> Self {
        Self {
            slot: Mutex::new(PumpSlot::Initial),
        }
    }

    fn subscribed(&self, handle: Option<ResolutionPump>) {
        let mut slot = self.slot.lock().unwrap();
        if let (PumpSlot::Initial, Some(handle)) = (&*slot, handle) {
            *slot = PumpSlot::Waiting(handle);
        }
    }

    fn resolved(&self, pump: Option<ResolutionPump>) {
        *self.slot.lock().unwrap() = match pump {
            Some(pump) => PumpSlot::Ready(pump),
            None => PumpSlot::Exhausted,
        };
    }

    fn failed(&self) {
        *self.slot.lock().unwrap() = PumpSlot::Closed;
    }

    /// Requests the next result. Returns false when there is none to request.
    fn pump(&self, ctx: &mut GraphBuildingContext) -> bool {
        let pump = {
            let mut slot = self.slot.lock().unwrap();
            match std::mem::take(&mut *slot) {
                PumpSlot::Ready(pump) => {
                    *slot = PumpSlot::Waiting(pump.clone());
                    pump
                }
                PumpSlot::Exhausted | PumpSlot::Closed => {
                    *slot = PumpSlot::Closed;
                    return false;
                }
                other => {
                    debug!("pump while delegate is waiting");
                    *slot = other;
                    return true;
                }
            }
        };
        ctx.pump(&pump);
        true
    }

    fn close(&self, ctx: &mut GraphBuildingContext) {
        let handle = std::mem::replace(&mut *self.slot.lock().unwrap(), PumpSlot::Closed).handle();
        if let Some(handle) = handle {
            ctx.close(&handle);
        }
    }
}

/// Passes on the results of another task's production.
pub(crate) struct DelegateStep {
    this: Weak<DelegateStep>,
    task: Weak<ResolveTask>,
    base: Arc<NextFunctionStep>,
    follower: Follower,
}

impl DelegateStep {
    pub(crate) fn new(task: Weak<ResolveTask>, base: Arc<NextFunctionStep>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            task,
            base,
            follower: Follower::new(),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>, ctx: &mut GraphBuildingContext, producer: &ProducerRef) {
        let handle = producer.core().add_callback(ctx, self.clone());
        self.follower.subscribed(handle);
    }

    pub(crate) fn pump(self: &Arc<Self>, _task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) {
        if !self.follower.pump(ctx) {
            self.base.resume(&TaskState::Delegate(self.clone()), ctx);
        }
    }

    pub(crate) fn discard(&self, ctx: &mut GraphBuildingContext) {
        self.follower.close(ctx);
    }
}

impl ResolvedValueCallback for DelegateStep {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        _: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        let (Some(this), Some(task)) = (self.this.upgrade(), self.task.upgrade()) else {
            if let Some(pump) = pump {
                ctx.close(&pump);
            }
            return;
        };
        self.follower.resolved(pump);
        if !task.push_result(ctx, value, false) {
            this.pump(&task, ctx);
        }
    }

    fn failed(&self, ctx: &mut GraphBuildingContext, _: &ValueRequirement, failure: Option<ResolutionFailure>) {
        self.follower.failed();
        if let Some(task) = self.task.upgrade() {
            task.store_failure(failure.as_ref());
        }
        if let Some(this) = self.this.upgrade() {
            self.base.resume(&TaskState::Delegate(this), ctx);
        }
    }

    fn recursion_detected(&self) {
        if let Some(task) = self.task.upgrade() {
            task.set_recursion_detected();
        }
    }

    fn owner(&self) -> Option<ProducerRef> {
        self.task.upgrade().map(|task| task as ProducerRef)
    }
}

/// What a substitute delegate falls back to when the producer it follows runs
/// out.
pub(crate) enum SubstituteFallback {
    /// Produce the substitute specification ourselves.
    Produce {
        inputs: BTreeMap<ValueSpecification, ValueRequirement>,
        resolved_output: ValueSpecification,
        resolved_outputs: BTreeSet<ValueSpecification>,
        last: bool,
    },
    /// Ask the function application for its next input combination.
    PumpWorker,
}

/// Follows another producer of the specification a function application
/// turned out to produce once its inputs were known.
pub(crate) struct SubstituteDelegateStep {
    this: Weak<SubstituteDelegateStep>,
    task: Weak<ResolveTask>,
    pumping: Arc<PumpingStep>,
    fallback: Mutex<Option<SubstituteFallback>>,
    follower: Follower,
}

impl SubstituteDelegateStep {
    pub(crate) fn new(
        task: Weak<ResolveTask>,
        pumping: Arc<PumpingStep>,
        fallback: SubstituteFallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            task,
            pumping,
            fallback: Mutex::new(Some(fallback)),
            follower: Follower::new(),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>, ctx: &mut GraphBuildingContext, producer: &ProducerRef) {
        let handle = producer.core().add_callback(ctx, self.clone());
        self.follower.subscribed(handle);
    }

    pub(crate) fn pump(self: &Arc<Self>, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) {
        if !self.follower.pump(ctx) {
            self.fail_over(task, ctx);
        }
    }

    pub(crate) fn discard(&self, task: &ResolveTask, ctx: &mut GraphBuildingContext) {
        self.follower.close(ctx);
        self.pumping.discard(task, ctx);
    }

    fn fail_over(self: &Arc<Self>, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) {
        let this_state = TaskState::SubstituteDelegate(self.clone());
        if !task.set_state(&this_state, TaskState::Pumping(self.pumping.clone())) {
            return;
        }
        let fallback = self.fallback.lock().unwrap().take();
        let produced = match fallback {
            Some(SubstituteFallback::Produce {
                inputs,
                resolved_output,
                resolved_outputs,
                last,
            }) => self
                .pumping
                .produce_substitute(ctx, task, inputs, resolved_output, resolved_outputs, last),
            Some(SubstituteFallback::PumpWorker) | None => false,
        };
        if !produced {
            self.pumping.worker().pump_inputs(ctx);
        }
    }
}

impl ResolvedValueCallback for SubstituteDelegateStep {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        _: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        let (Some(this), Some(task)) = (self.this.upgrade(), self.task.upgrade()) else {
            if let Some(pump) = pump {
                ctx.close(&pump);
            }
            return;
        };
        self.follower.resolved(pump);
        if !task.push_result(ctx, value, false) {
            this.pump(&task, ctx);
        }
    }

    fn failed(&self, ctx: &mut GraphBuildingContext, _: &ValueRequirement, failure: Option<ResolutionFailure>) {
        self.follower.failed();
        if let (Some(this), Some(task)) = (self.this.upgrade(), self.task.upgrade()) {
            task.store_failure(failure.as_ref());
            this.fail_over(&task, ctx);
        }
    }

    fn recursion_detected(&self) {
        if let Some(task) = self.task.upgrade() {
            task.set_recursion_detected();
        }
    }

    fn owner(&self) -> Option<ProducerRef> {
        self.task.upgrade().map(|task| task as ProducerRef)
    }
}
