use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::engine::steps::PumpingStep;
use crate::engine::{
    CallbackRef, GraphBuildingContext, ProducerCore, ProducerRef, ResolutionPump, ResolvedValueCallback,
    ResolvedValueProducer,
};
use crate::failure::{ApplicationOutcome, ResolutionFailure};
use crate::value::{ResolvedValue, ValueRequirement, ValueSpecification};

type Invocation = (BTreeMap<ValueSpecification, ValueRequirement>, bool);

#[derive(Default)]
struct WorkerState {
    step: Option<Arc<PumpingStep>>,
    started: bool,
    done: bool,
    can_handle_missing: bool,
    /// Inputs still waiting for their first value.
    pending: usize,
    inputs: BTreeMap<ValueRequirement, ValueSpecification>,
    missing: BTreeSet<ValueRequirement>,
    /// Inputs with further alternatives, in the order to try them.
    pumps: VecDeque<(ValueRequirement, ResolutionPump)>,
    handles: Vec<ResolutionPump>,
    in_flight: Option<ValueRequirement>,
    invoking: bool,
    deferred_pump: bool,
    rerun: bool,
}

impl WorkerState {
    fn next_invocation(&mut self) -> Option<Invocation> {
        if !self.started || self.done || self.invoking || self.pending > 0 || self.step.is_none() {
            return None;
        }
        self.invoking = true;
        let inputs = self
            .inputs
            .iter()
            .map(|(requirement, spec)| (spec.clone(), requirement.clone()))
            .collect();
        let last = self.pumps.is_empty() && self.in_flight.is_none();
        Some((inputs, last))
    }

    fn take_subscriptions(&mut self) -> Vec<ResolutionPump> {
        let mut subscriptions = std::mem::take(&mut self.handles);
        subscriptions.extend(self.pumps.drain(..).map(|(_, pump)| pump));
        subscriptions
    }
}

/// Collects the inputs of one function application and hands every complete
/// combination to its [`PumpingStep`].
///
/// It is also the producer registered for the application's output, so other
/// tasks wanting the same specification subscribe to it.
pub(crate) struct FunctionApplicationWorker {
    core: ProducerCore,
    this: Weak<FunctionApplicationWorker>,
    state: Mutex<WorkerState>,
}

impl FunctionApplicationWorker {
    pub(crate) fn new(requirement: ValueRequirement) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<FunctionApplicationWorker>| Self {
            core: ProducerCore::new(requirement, this.clone()),
            this: this.clone(),
            state: Mutex::new(WorkerState::default()),
        })
    }

    pub(crate) fn begin(&self, step: Arc<PumpingStep>, inputs: usize, can_handle_missing: bool) {
        if self.core.is_discarded() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.step = Some(step);
        state.pending = inputs;
        state.can_handle_missing = can_handle_missing;
    }

    pub(crate) fn add_input(&self, ctx: &mut GraphBuildingContext, requirement: &ValueRequirement, producer: &ProducerRef) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if self.state.lock().unwrap().done {
            return;
        }
        trace_input(&self.core, requirement);
        let handle = producer.core().add_callback(ctx, this as CallbackRef);
        if let Some(handle) = handle {
            let mut state = self.state.lock().unwrap();
            if state.done {
                drop(state);
                ctx.close(&handle);
            } else {
                state.handles.push(handle);
            }
        }
    }

    /// An input that would have needed one of the task's own ancestors.
    pub(crate) fn recursive_input(&self, ctx: &mut GraphBuildingContext, requirement: &ValueRequirement) {
        self.recursion_detected();
        let failure = ctx.recursive_requirement(requirement);
        self.failed(ctx, requirement, failure);
    }

    /// All inputs are subscribed. Runs the first invocation if every input
    /// already has a value.
    pub(crate) fn start(&self, ctx: &mut GraphBuildingContext) {
        let mut state = self.state.lock().unwrap();
        let Some(step) = state.step.clone() else {
            return;
        };
        state.started = true;
        if state.done {
            drop(state);
            self.finish(ctx, &step);
            return;
        }
        let next = state.next_invocation();
        drop(state);
        if let Some((inputs, last)) = next {
            self.invoke(ctx, &step, inputs, last);
        }
    }

    /// Asks one input for its next alternative, or finishes when none has any.
    pub(crate) fn pump_inputs(&self, ctx: &mut GraphBuildingContext) {
        let mut state = self.state.lock().unwrap();
        let Some(step) = state.step.clone() else {
            return;
        };
        if state.done {
            drop(state);
            step.finished(ctx);
            return;
        }
        if state.invoking {
            state.deferred_pump = true;
            return;
        }
        if !state.started || state.pending > 0 || state.in_flight.is_some() {
            return;
        }
        match state.pumps.pop_front() {
            Some((requirement, pump)) => {
                debug!(worker = self.core.id(), input = %requirement, "pumping input");
                state.in_flight = Some(requirement);
                drop(state);
                ctx.pump(&pump);
            }
            None => {
                state.done = true;
                drop(state);
                debug!(worker = self.core.id(), "no more input combinations");
                self.finish(ctx, &step);
            }
        }
    }

    fn invoke(
        &self,
        ctx: &mut GraphBuildingContext,
        step: &Arc<PumpingStep>,
        mut inputs: BTreeMap<ValueSpecification, ValueRequirement>,
        mut last: bool,
    ) {
        loop {
            let accepted = step.inputs_available(ctx, inputs, last);
            let mut state = self.state.lock().unwrap();
            state.invoking = false;
            if std::mem::take(&mut state.rerun)
                && let Some(next) = state.next_invocation()
            {
                (inputs, last) = next;
                continue;
            }
            let pump = !accepted || std::mem::take(&mut state.deferred_pump);
            drop(state);
            if pump {
                self.pump_inputs(ctx);
            }
            return;
        }
    }

    fn finish(&self, ctx: &mut GraphBuildingContext, step: &Arc<PumpingStep>) {
        let subscriptions = self.state.lock().unwrap().take_subscriptions();
        for subscription in subscriptions {
            ctx.close(&subscription);
        }
        self.core.finished(ctx);
        step.finished(ctx);
    }

    fn step(&self) -> Option<Arc<PumpingStep>> {
        self.state.lock().unwrap().step.clone()
    }
}

fn trace_input(core: &ProducerCore, requirement: &ValueRequirement) {
    tracing::trace!(worker = core.id(), input = %requirement, "subscribing to input");
}

impl ResolvedValueProducer for FunctionApplicationWorker {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn pump_impl(&self, ctx: &mut GraphBuildingContext) {
        self.pump_inputs(ctx);
    }

    fn discard(&self, ctx: &mut GraphBuildingContext) {
        let subscriptions = {
            let mut state = self.state.lock().unwrap();
            state.done = true;
            state.step = None;
            state.take_subscriptions()
        };
        for subscription in subscriptions {
            ctx.close(&subscription);
        }
    }

    fn blocked_dependents(&self) -> Vec<ProducerRef> {
        self.step()
            .and_then(|step| step.task())
            .map(|task| vec![task as ProducerRef])
            .unwrap_or_default()
    }
}

impl ResolvedValueCallback for FunctionApplicationWorker {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.done || state.step.is_none() {
            drop(state);
            if let Some(pump) = pump {
                ctx.close(&pump);
            }
            return;
        }
        let first = !state.inputs.contains_key(requirement) && !state.missing.contains(requirement);
        state
            .inputs
            .insert(requirement.clone(), value.specification().clone());
        if first {
            state.pending = state.pending.saturating_sub(1);
        }
        if state.in_flight.as_ref() == Some(requirement) {
            state.in_flight = None;
        }
        if let Some(pump) = pump {
            state.pumps.push_back((requirement.clone(), pump));
        }
        if state.invoking {
            state.rerun = true;
            return;
        }
        let next = state.next_invocation();
        let step = state.step.clone();
        drop(state);
        if let (Some((inputs, last)), Some(step)) = (next, step) {
            self.invoke(ctx, &step, inputs, last);
        }
    }

    fn failed(&self, ctx: &mut GraphBuildingContext, requirement: &ValueRequirement, failure: Option<ResolutionFailure>) {
        let mut state = self.state.lock().unwrap();
        let Some(step) = state.step.clone() else {
            return;
        };
        if state.done {
            return;
        }

        if state.inputs.contains_key(requirement) {
            // Out of alternatives for this input, its current value stands.
            if state.in_flight.as_ref() == Some(requirement) {
                state.in_flight = None;
            }
            drop(state);
            self.pump_inputs(ctx);
            return;
        }

        if !state.missing.insert(requirement.clone()) {
            return;
        }
        state.pending = state.pending.saturating_sub(1);

        if state.can_handle_missing {
            debug!(worker = self.core.id(), input = %requirement, "input missing, function copes");
            let next = state.next_invocation();
            drop(state);
            if let Some((inputs, last)) = next {
                self.invoke(ctx, &step, inputs, last);
            }
            return;
        }

        state.done = true;
        let started = state.started;
        drop(state);

        info!(requirement = %self.core.requirement(), input = %requirement, "input unsatisfied");
        let application_failure = ctx
            .function_application(self.core.requirement(), step.function(), step.resolved_output())
            .map(|application| {
                application
                    .with_unsatisfied(requirement, failure.as_ref())
                    .finish(ApplicationOutcome::Unsatisfied)
            });
        step.store_failure(application_failure.as_ref());
        if started {
            self.finish(ctx, &step);
        }
    }

    fn recursion_detected(&self) {
        match self.step() {
            Some(step) => step.set_recursion_detected(),
            None => self.core.set_recursion_detected(),
        }
    }

    fn owner(&self) -> Option<ProducerRef> {
        self.this.upgrade().map(|this| this as ProducerRef)
    }
}
