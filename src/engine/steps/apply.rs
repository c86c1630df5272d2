use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::engine::context::Declared;
use crate::engine::steps::delegate::SubstituteFallback;
use crate::engine::steps::{DelegateStep, NextFunctionStep, SubstituteDelegateStep, TaskState};
use crate::engine::{
    FunctionApplicationWorker, GraphBuildingContext, ProducerRef, ResolutionPump, ResolveTask,
    ResolvedValueCallback, ResolvedValueProducer,
};
use crate::failure::{ApplicationOutcome, ResolutionFailure};
use crate::function::{FunctionCandidate, ParameterizedFunction};
use crate::value::{ResolvedValue, ValueRequirement, ValueSpecification};

/// Registers the task as producer of the candidate's output and asks the
/// function for its inputs.
pub(crate) struct FunctionApplicationStep {
    base: Arc<NextFunctionStep>,
    candidate: FunctionCandidate,
    resolved_output: ValueSpecification,
}

impl FunctionApplicationStep {
    pub(crate) fn new(
        base: Arc<NextFunctionStep>,
        candidate: FunctionCandidate,
        resolved_output: ValueSpecification,
    ) -> Self {
        Self {
            base,
            candidate,
            resolved_output,
        }
    }

    pub(crate) fn run(self: &Arc<Self>, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) -> bool {
        let this_state = TaskState::ApplyFunction(self.clone());
        let requirement = task.requirement().clone();
        let function = self.candidate.function.clone();

        let worker = FunctionApplicationWorker::new(requirement.clone());
        match ctx.declare_task_producing(&self.resolved_output, task, worker.clone()) {
            Declared::Producer => {}
            Declared::Existing(producer) => {
                worker.release(ctx);
                debug!(%requirement, spec = %self.resolved_output, "joining concurrent production");
                let delegate = DelegateStep::new(Arc::downgrade(task), self.base.clone());
                if task.set_state(&this_state, TaskState::Delegate(delegate.clone())) {
                    delegate.subscribe(ctx, &producer);
                }
                producer.release(ctx);
                return true;
            }
            Declared::Recursive => {
                worker.release(ctx);
                debug!(%requirement, spec = %self.resolved_output, "production would be recursive");
                task.set_recursion_detected();
                task.store_failure(ctx.recursive_requirement(&requirement).as_ref());
                self.base.resume(&this_state, ctx);
                return true;
            }
        }

        let target = self.base.target().clone();
        let inputs = ctx.call_function("get_requirements", &function, |context| {
            function
                .definition()
                .get_requirements(context, &target, &requirement)
        });
        let Some(inputs) = inputs else {
            info!(%requirement, %function, "function can't produce requirement");
            let failure = ctx
                .function_application(&requirement, &function, &self.resolved_output)
                .map(|failure| failure.finish(ApplicationOutcome::GetRequirementsFailed));
            task.store_failure(failure.as_ref());
            abandon(ctx, task, &worker, &self.resolved_output, failure.as_ref());
            self.base.resume(&this_state, ctx);
            return true;
        };

        let mut outputs: BTreeSet<ValueSpecification> = self
            .candidate
            .outputs
            .iter()
            .filter(|output| **output != self.candidate.output)
            .cloned()
            .collect();
        outputs.insert(self.resolved_output.clone());

        let pumping = PumpingStep::new(
            Arc::downgrade(task),
            self.base.clone(),
            function.clone(),
            self.resolved_output.clone(),
            outputs,
            worker.clone(),
        );
        if !task.set_state(&this_state, TaskState::Pumping(pumping.clone())) {
            abandon(ctx, task, &worker, &self.resolved_output, None);
            return true;
        }

        debug!(%requirement, %function, inputs = inputs.len(), "applying function");
        worker.begin(
            pumping.clone(),
            inputs.len(),
            function.definition().can_handle_missing_requirements(),
        );
        for input in &inputs {
            let exclusion = ctx.input_exclusion(task, &function, input, &target);
            match ctx.resolve_requirement(input, Some(task), exclusion) {
                Some(producer) => {
                    worker.add_input(ctx, input, &producer);
                    producer.release(ctx);
                }
                None => worker.recursive_input(ctx, input),
            }
        }
        worker.start(ctx);
        true
    }
}

/// Withdraws a worker that never started and drops its creation reference.
fn abandon(
    ctx: &mut GraphBuildingContext,
    task: &ResolveTask,
    worker: &Arc<FunctionApplicationWorker>,
    spec: &ValueSpecification,
    failure: Option<&ResolutionFailure>,
) {
    worker.core().store_failure(failure);
    worker.core().finished(ctx);
    ctx.discard_task_producing(spec, task);
    worker.release(ctx);
}

/// The function's inputs are being resolved by the worker. Each complete
/// input combination is turned into a result here.
pub(crate) struct PumpingStep {
    this: Weak<PumpingStep>,
    task: Weak<ResolveTask>,
    base: Arc<NextFunctionStep>,
    function: ParameterizedFunction,
    resolved_output: ValueSpecification,
    outputs: BTreeSet<ValueSpecification>,
    worker: Arc<FunctionApplicationWorker>,
    worker_released: AtomicBool,
}

impl PumpingStep {
    pub(crate) fn new(
        task: Weak<ResolveTask>,
        base: Arc<NextFunctionStep>,
        function: ParameterizedFunction,
        resolved_output: ValueSpecification,
        outputs: BTreeSet<ValueSpecification>,
        worker: Arc<FunctionApplicationWorker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            task,
            base,
            function,
            resolved_output,
            outputs,
            worker,
            worker_released: AtomicBool::new(false),
        })
    }

    pub(crate) fn worker(&self) -> &Arc<FunctionApplicationWorker> {
        &self.worker
    }

    pub(crate) fn function(&self) -> &ParameterizedFunction {
        &self.function
    }

    pub(crate) fn resolved_output(&self) -> &ValueSpecification {
        &self.resolved_output
    }

    pub(crate) fn task(&self) -> Option<Arc<ResolveTask>> {
        self.task.upgrade()
    }

    pub(crate) fn pump(&self, ctx: &mut GraphBuildingContext) {
        self.worker.pump_inputs(ctx);
    }

    /// Records a failure against the application and the task.
    pub(crate) fn store_failure(&self, failure: Option<&ResolutionFailure>) {
        self.worker.core().store_failure(failure);
        if let Some(task) = self.task.upgrade() {
            task.store_failure(failure);
        }
    }

    pub(crate) fn set_recursion_detected(&self) {
        self.worker.core().set_recursion_detected();
        if let Some(task) = self.task.upgrade() {
            task.set_recursion_detected();
        }
    }

    /// The worker has no further input combinations: back to the candidates.
    pub(crate) fn finished(&self, ctx: &mut GraphBuildingContext) {
        let (Some(this), Some(task)) = (self.this.upgrade(), self.task.upgrade()) else {
            return;
        };
        if task.set_state(&TaskState::Pumping(this), TaskState::NextFunction(self.base.clone())) {
            ctx.discard_task_producing(&self.resolved_output, &task);
            self.release_worker(ctx);
            ctx.run(task);
        }
    }

    pub(crate) fn discard(&self, task: &ResolveTask, ctx: &mut GraphBuildingContext) {
        ctx.discard_task_producing(&self.resolved_output, task);
        self.release_worker(ctx);
    }

    fn release_worker(&self, ctx: &mut GraphBuildingContext) {
        if !self.worker_released.swap(true, Ordering::AcqRel) {
            self.worker.release(ctx);
        }
    }

    fn failure(
        &self,
        task: &ResolveTask,
        output: &ValueSpecification,
        inputs: &BTreeMap<ValueSpecification, ValueRequirement>,
        ctx: &GraphBuildingContext,
        outcome: ApplicationOutcome,
    ) -> Option<ResolutionFailure> {
        ctx.function_application(task.requirement(), &self.function, output)
            .map(|failure| failure.with_inputs(inputs).finish(outcome))
    }

    /// A complete set of inputs is available. Returns false when the worker
    /// should move on to its next input combination straight away.
    pub(crate) fn inputs_available(
        self: &Arc<Self>,
        ctx: &mut GraphBuildingContext,
        inputs: BTreeMap<ValueSpecification, ValueRequirement>,
        last: bool,
    ) -> bool {
        let Some(task) = self.task.upgrade() else {
            return true;
        };
        let requirement = task.requirement().clone();
        let target = self.base.target().clone();

        let results = ctx.call_function("get_results", &self.function, |context| {
            self.function
                .definition()
                .get_results(context, &target, &inputs, &self.outputs)
        });
        let Some(results) = results else {
            info!(%requirement, function = %self.function, "function can't produce results from its inputs");
            let failure = self.failure(&task, &self.resolved_output, &inputs, ctx, ApplicationOutcome::GetResultsFailed);
            self.store_failure(failure.as_ref());
            return false;
        };

        if results == self.outputs {
            return self.additional_requirements(
                ctx,
                &task,
                None,
                inputs,
                self.resolved_output.clone(),
                self.outputs.clone(),
                last,
            );
        }

        let Some((resolved_output, resolved_outputs)) = resolve_outputs(&requirement, &results) else {
            info!(%requirement, function = %self.function, "actual results don't satisfy the requirement");
            let failure = self.failure(&task, &self.resolved_output, &inputs, ctx, ApplicationOutcome::LateResolutionFailure);
            self.store_failure(failure.as_ref());
            return false;
        };

        if resolved_output == self.resolved_output {
            return self.additional_requirements(ctx, &task, None, inputs, resolved_output, resolved_outputs, last);
        }

        debug!(%requirement, provisional = %self.resolved_output, actual = %resolved_output, "late resolution");
        if let Some((owner, producer)) = ctx.get_tasks_producing(&resolved_output) {
            if task.descends_from(&owner) {
                producer.release(ctx);
                return self.produce_substitute(ctx, &task, inputs, resolved_output, resolved_outputs, last);
            }
            let delegate = SubstituteDelegateStep::new(
                Arc::downgrade(&task),
                self.clone(),
                SubstituteFallback::Produce {
                    inputs,
                    resolved_output,
                    resolved_outputs,
                    last,
                },
            );
            if task.set_state(
                &TaskState::Pumping(self.clone()),
                TaskState::SubstituteDelegate(delegate.clone()),
            ) {
                delegate.subscribe(ctx, &producer);
            }
            producer.release(ctx);
            return true;
        }

        if let Some(existing) = ctx.get_production(&resolved_output) {
            if task.push_result(ctx, existing, false) {
                return true;
            }
        }
        self.produce_substitute(ctx, &task, inputs, resolved_output, resolved_outputs, last)
    }

    /// Produces a specification other than the one registered for this
    /// application, through a single-use worker registered for it.
    pub(crate) fn produce_substitute(
        self: &Arc<Self>,
        ctx: &mut GraphBuildingContext,
        task: &Arc<ResolveTask>,
        inputs: BTreeMap<ValueSpecification, ValueRequirement>,
        resolved_output: ValueSpecification,
        resolved_outputs: BTreeSet<ValueSpecification>,
        last: bool,
    ) -> bool {
        if inputs.contains_key(&resolved_output) {
            debug!(spec = %resolved_output, "substitute would consume itself, backtracking");
            return false;
        }

        let substitute = FunctionApplicationWorker::new(task.requirement().clone());
        match ctx.declare_task_producing(&resolved_output, task, substitute.clone()) {
            Declared::Producer => {
                let accepted = self.additional_requirements(
                    ctx,
                    task,
                    Some(substitute.clone()),
                    inputs,
                    resolved_output,
                    resolved_outputs,
                    last,
                );
                substitute.release(ctx);
                accepted
            }
            Declared::Existing(producer) => {
                substitute.release(ctx);
                let delegate = SubstituteDelegateStep::new(
                    Arc::downgrade(task),
                    self.clone(),
                    SubstituteFallback::PumpWorker,
                );
                if task.set_state(
                    &TaskState::Pumping(self.clone()),
                    TaskState::SubstituteDelegate(delegate.clone()),
                ) {
                    delegate.subscribe(ctx, &producer);
                }
                producer.release(ctx);
                true
            }
            Declared::Recursive => {
                substitute.release(ctx);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn additional_requirements(
        self: &Arc<Self>,
        ctx: &mut GraphBuildingContext,
        task: &Arc<ResolveTask>,
        substitute: Option<Arc<FunctionApplicationWorker>>,
        inputs: BTreeMap<ValueSpecification, ValueRequirement>,
        resolved_output: ValueSpecification,
        resolved_outputs: BTreeSet<ValueSpecification>,
        last: bool,
    ) -> bool {
        let target = self.base.target().clone();
        let input_specs: BTreeSet<ValueSpecification> = inputs.keys().cloned().collect();
        let additional = ctx.call_function("get_additional_requirements", &self.function, |context| {
            self.function.definition().get_additional_requirements(
                context,
                &target,
                &input_specs,
                &resolved_outputs,
            )
        });
        let Some(additional) = additional else {
            info!(requirement = %task.requirement(), function = %self.function, "additional requirements failed");
            let failure = self.failure(task, &resolved_output, &inputs, ctx, ApplicationOutcome::GetAdditionalRequirementsFailed);
            self.fail_substitute(ctx, task, substitute.as_ref(), &resolved_output, failure.as_ref());
            self.store_failure(failure.as_ref());
            return false;
        };

        if additional.is_empty() {
            return self.push_result(
                ctx,
                task,
                substitute.as_ref(),
                &inputs,
                resolved_output,
                resolved_outputs,
                last,
            );
        }

        debug!(requirement = %task.requirement(), count = additional.len(), "resolving additional requirements");
        let join = Arc::new(AdditionalRequirements {
            step: self.clone(),
            substitute,
            resolved_output,
            resolved_outputs,
            last,
            state: Mutex::new(JoinState {
                inputs,
                pending: additional.len() + 1,
                failed: false,
            }),
        });
        for requirement in &additional {
            match ctx.resolve_requirement(requirement, Some(task), None) {
                Some(producer) => {
                    producer.core().add_callback(ctx, join.clone());
                    producer.release(ctx);
                }
                None => {
                    self.set_recursion_detected();
                    let failure = ctx.recursive_requirement(requirement);
                    join.failed(ctx, requirement, failure);
                }
            }
        }
        join.countdown(ctx);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn push_result(
        &self,
        ctx: &mut GraphBuildingContext,
        task: &Arc<ResolveTask>,
        substitute: Option<&Arc<FunctionApplicationWorker>>,
        inputs: &BTreeMap<ValueSpecification, ValueRequirement>,
        resolved_output: ValueSpecification,
        resolved_outputs: BTreeSet<ValueSpecification>,
        last: bool,
    ) -> bool {
        let input_specs: BTreeSet<ValueSpecification> = inputs.keys().cloned().collect();
        if ctx.is_blacklisted(&self.function, self.base.target(), &input_specs, &resolved_outputs) {
            info!(requirement = %task.requirement(), function = %self.function, "application suppressed");
            let failure = self.failure(task, &resolved_output, inputs, ctx, ApplicationOutcome::Suppressed);
            self.fail_substitute(ctx, task, substitute, &resolved_output, failure.as_ref());
            self.store_failure(failure.as_ref());
            return false;
        }
        if input_specs.contains(&resolved_output) {
            debug!(spec = %resolved_output, "application would consume its own output");
            self.fail_substitute(ctx, task, substitute, &resolved_output, None);
            return false;
        }

        let value = Arc::new(ResolvedValue::new(
            resolved_output.clone(),
            self.function.clone(),
            input_specs,
            resolved_outputs,
        ));
        ctx.declare_production(value.clone());
        match substitute {
            Some(substitute) => {
                substitute.core().push_result(ctx, value.clone(), true);
                ctx.discard_task_producing(&resolved_output, task);
            }
            None => {
                self.worker.core().push_result(ctx, value.clone(), last);
            }
        }
        task.push_result(ctx, value, false)
    }

    fn fail_substitute(
        &self,
        ctx: &mut GraphBuildingContext,
        task: &ResolveTask,
        substitute: Option<&Arc<FunctionApplicationWorker>>,
        spec: &ValueSpecification,
        failure: Option<&ResolutionFailure>,
    ) {
        if let Some(substitute) = substitute {
            substitute.core().store_failure(failure);
            substitute.core().finished(ctx);
            ctx.discard_task_producing(spec, task);
        }
    }
}

/// Picks the output satisfying `requirement` from the actual results,
/// narrowing it to the requirement's constraints.
fn resolve_outputs(
    requirement: &ValueRequirement,
    results: &BTreeSet<ValueSpecification>,
) -> Option<(ValueSpecification, BTreeSet<ValueSpecification>)> {
    let mut resolved = None;
    let mut outputs = BTreeSet::new();
    for output in results {
        if resolved.is_none()
            && output.name() == requirement.name()
            && requirement.constraints().is_satisfied_by(output.properties())
        {
            let composed = output.compose(requirement);
            outputs.insert(composed.clone());
            resolved = Some(composed);
        } else {
            outputs.insert(output.clone());
        }
    }
    resolved.map(|resolved| (resolved, outputs))
}

struct JoinState {
    inputs: BTreeMap<ValueSpecification, ValueRequirement>,
    /// Outstanding additional requirements, plus one until all are subscribed.
    pending: usize,
    failed: bool,
}

/// Waits for every additional requirement before the result is pushed.
struct AdditionalRequirements {
    step: Arc<PumpingStep>,
    substitute: Option<Arc<FunctionApplicationWorker>>,
    resolved_output: ValueSpecification,
    resolved_outputs: BTreeSet<ValueSpecification>,
    last: bool,
    state: Mutex<JoinState>,
}

impl AdditionalRequirements {
    fn countdown(&self, ctx: &mut GraphBuildingContext) {
        let (failed, inputs) = {
            let mut state = self.state.lock().unwrap();
            state.pending -= 1;
            if state.pending > 0 {
                return;
            }
            (state.failed, std::mem::take(&mut state.inputs))
        };
        let Some(task) = self.step.task() else {
            return;
        };
        let pushed = !failed
            && self.step.push_result(
                ctx,
                &task,
                self.substitute.as_ref(),
                &inputs,
                self.resolved_output.clone(),
                self.resolved_outputs.clone(),
                self.last,
            );
        if !pushed {
            self.step.worker().pump_inputs(ctx);
        }
    }
}

impl ResolvedValueCallback for AdditionalRequirements {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        if let Some(pump) = pump {
            ctx.close(&pump);
        }
        self.state
            .lock()
            .unwrap()
            .inputs
            .insert(value.specification().clone(), requirement.clone());
        self.countdown(ctx);
    }

    fn failed(&self, ctx: &mut GraphBuildingContext, requirement: &ValueRequirement, failure: Option<ResolutionFailure>) {
        let first = {
            let mut state = self.state.lock().unwrap();
            !std::mem::replace(&mut state.failed, true)
        };
        if first && let Some(task) = self.step.task() {
            info!(requirement = %task.requirement(), additional = %requirement, "additional requirement unsatisfied");
            let inputs = self.state.lock().unwrap().inputs.clone();
            let failure = ctx
                .function_application(task.requirement(), self.step.function(), &self.resolved_output)
                .map(|application| {
                    application
                        .with_inputs(&inputs)
                        .with_additional_unsatisfied(requirement, failure.as_ref())
                        .finish(ApplicationOutcome::Unsatisfied)
                });
            self.step.fail_substitute(
                ctx,
                &task,
                self.substitute.as_ref(),
                &self.resolved_output,
                failure.as_ref(),
            );
            self.step.store_failure(failure.as_ref());
        }
        self.countdown(ctx);
    }

    fn recursion_detected(&self) {
        self.step.set_recursion_detected();
    }

    fn owner(&self) -> Option<ProducerRef> {
        Some(self.step.worker().clone() as ProducerRef)
    }
}
