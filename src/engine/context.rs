use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace};

use crate::builder::{BuilderState, job};
use crate::core::guarded;
use crate::engine::{
    AggregateResolvedValueProducer, CallbackRef, ContextRunnable, ExclusionSet, ProducerRef,
    ResolutionPump, ResolveTask, ResolvedValueProducer, Runnable, SpecificationEntry,
};
use crate::error::{AvailabilityError, ResolutionError};
use crate::failure::{FailureEvent, FunctionApplication, ResolutionFailure};
use crate::function::{CandidateIter, CompilationContext, ParameterizedFunction};
use crate::value::{
    ResolvedValue, TargetReference, TargetSpecification, ValueRequirement, ValueSpecification,
};

/// Outcome of registering as the producer of a specification.
pub(crate) enum Declared {
    /// Registered. The cache holds its own reference to the producer.
    Producer,
    /// Someone else is producing it already. The caller owns one reference.
    Existing(ProducerRef),
    /// The registered producer belongs to the caller or one of its ancestors.
    Recursive,
}

/// The view of the build every unit of work runs against.
///
/// One context exists per thread of execution. It carries the call depth of
/// nested callback deliveries, everything else lives in the shared
/// [`BuilderState`].
pub(crate) struct GraphBuildingContext {
    state: Arc<BuilderState>,
    depth: usize,
}

impl GraphBuildingContext {
    pub(crate) fn new(state: Arc<BuilderState>) -> Self {
        Self { state, depth: 0 }
    }

    pub(crate) fn state(&self) -> &Arc<BuilderState> {
        &self.state
    }

    pub(crate) fn run(&mut self, task: Arc<ResolveTask>) {
        self.submit(task);
    }

    pub(crate) fn submit(&mut self, runnable: Runnable) {
        job::submit(&self.state, runnable);
    }

    fn too_deep(&self) -> bool {
        self.depth >= self.state.config.max_callback_depth
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self)) {
        self.depth += 1;
        f(self);
        self.depth -= 1;
    }

    // Callback delivery. Chains of producers deliver to each other directly
    // until the depth limit, past which delivery continues from the run queue.

    pub(crate) fn resolved(
        &mut self,
        callback: &CallbackRef,
        requirement: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        if self.too_deep() {
            self.defer(callback, requirement, Deferred::Resolved(value, pump));
            return;
        }
        self.nested(|ctx| callback.resolved(ctx, requirement, value, pump));
    }

    pub(crate) fn failed(
        &mut self,
        callback: &CallbackRef,
        requirement: &ValueRequirement,
        failure: Option<ResolutionFailure>,
    ) {
        if self.too_deep() {
            self.defer(callback, requirement, Deferred::Failed(failure));
            return;
        }
        self.nested(|ctx| callback.failed(ctx, requirement, failure));
    }

    pub(crate) fn pump(&mut self, pump: &ResolutionPump) {
        if self.too_deep() {
            self.submit(Arc::new(DeferredPump {
                pump: pump.clone(),
                close: false,
            }));
            return;
        }
        self.nested(|ctx| pump.pump(ctx));
    }

    pub(crate) fn close(&mut self, pump: &ResolutionPump) {
        if self.too_deep() {
            self.submit(Arc::new(DeferredPump {
                pump: pump.clone(),
                close: true,
            }));
            return;
        }
        self.nested(|ctx| pump.close(ctx));
    }

    fn defer(&mut self, callback: &CallbackRef, requirement: &ValueRequirement, delivery: Deferred) {
        trace!(depth = self.depth, %requirement, "deferring callback");
        self.submit(Arc::new(DeferredCallback {
            callback: callback.clone(),
            requirement: requirement.clone(),
            delivery: Mutex::new(Some(delivery)),
        }));
    }

    // Requirement resolution.

    /// Finds or starts the work resolving `requirement` for `dependent`. The
    /// caller owns one reference on the returned producer. `None` means the
    /// requirement is one of the dependent's ancestors.
    pub(crate) fn resolve_requirement(
        &mut self,
        requirement: &ValueRequirement,
        dependent: Option<&Arc<ResolveTask>>,
        exclusion: Option<ExclusionSet>,
    ) -> Option<ProducerRef> {
        if let Some(dependent) = dependent
            && dependent.has_parent(requirement)
        {
            debug!(%requirement, "recursive requirement");
            dependent.set_recursion_detected();
            return None;
        }

        let task = ResolveTask::new(requirement.clone(), dependent, exclusion);
        let mut existing = self
            .state
            .requirements
            .with_existing(requirement, |entry| {
                entry
                    .values()
                    .filter(|candidate| candidate.key().can_stand_in_for(task.key()))
                    .filter(|candidate| candidate.core().add_ref())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if existing.is_empty() {
            return Some(self.get_or_create_task_resolving(task) as ProducerRef);
        }

        if let Some(index) = existing.iter().position(|candidate| candidate.key() == task.key()) {
            let same = existing.swap_remove(index);
            for other in existing {
                other.release(self);
            }
            task.release(self);
            return Some(same as ProducerRef);
        }

        debug!(%requirement, tasks = existing.len(), "aggregating existing tasks");
        let aggregate = AggregateResolvedValueProducer::new(requirement.clone(), Some(task));
        for candidate in existing {
            aggregate.add_producer(self, candidate.clone());
            candidate.release(self);
        }
        aggregate.start(self);
        Some(aggregate as ProducerRef)
    }

    /// Registers `task` in the requirement cache unless an equivalent one is
    /// there already, and returns whichever won with a reference for the
    /// caller. A newly registered task is scheduled.
    pub(crate) fn get_or_create_task_resolving(&mut self, task: Arc<ResolveTask>) -> Arc<ResolveTask> {
        let (winner, created) = self.state.requirements.with(task.requirement(), |entry| {
            if let Some(existing) = entry.get(task.key())
                && existing.core().add_ref()
            {
                return (existing.clone(), false);
            }
            // One reference for the cache, the creation reference for the caller.
            task.core().add_ref();
            entry.insert(task.key().clone(), task.clone());
            (task.clone(), true)
        });
        if created {
            trace!(task = winner.core().id(), requirement = %winner.requirement(), "new task");
            self.run(winner.clone());
        } else {
            task.release(self);
        }
        winner
    }

    /// Drops an unfinished task only the cache still references.
    pub(crate) fn discard_task(&mut self, task: &Arc<ResolveTask>) {
        let removed = self
            .state
            .requirements
            .with_existing(task.requirement(), |entry| match entry.get(task.key()) {
                Some(cached)
                    if Arc::ptr_eq(cached, task)
                        && task.core().ref_count() == 1
                        && !task.is_finished() =>
                {
                    entry.remove(task.key())
                }
                _ => None,
            })
            .flatten();
        if let Some(task) = removed {
            trace!(task = task.core().id(), "discarding unwanted task");
            task.release(self);
        }
    }

    /// Drops a task from the requirement cache whatever its state.
    pub(crate) fn remove_task(&mut self, task: &Arc<ResolveTask>) -> bool {
        let removed = self
            .state
            .requirements
            .with_existing(task.requirement(), |entry| match entry.get(task.key()) {
                Some(cached) if Arc::ptr_eq(cached, task) => entry.remove(task.key()),
                _ => None,
            })
            .flatten();
        match removed {
            Some(task) => {
                task.release(self);
                true
            }
            None => false,
        }
    }

    // Specification registry.

    pub(crate) fn declare_task_producing(
        &mut self,
        spec: &ValueSpecification,
        task: &Arc<ResolveTask>,
        producer: ProducerRef,
    ) -> Declared {
        self.state.specifications.with(spec, |slot| {
            if let Some(entry) = slot {
                if task.descends_from(&entry.task) {
                    return Declared::Recursive;
                }
                if entry.producer.core().add_ref() {
                    return Declared::Existing(entry.producer.clone());
                }
            }
            producer.core().add_ref();
            *slot = Some(SpecificationEntry {
                task: task.clone(),
                producer,
            });
            Declared::Producer
        })
    }

    /// Withdraws the registration `task` made for `spec`, if it is still the
    /// registered one.
    pub(crate) fn discard_task_producing(&mut self, spec: &ValueSpecification, task: &ResolveTask) {
        let removed = self
            .state
            .specifications
            .with_existing(spec, |slot| {
                let owned = slot
                    .as_ref()
                    .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry.task), task));
                if owned { slot.take() } else { None }
            })
            .flatten();
        if let Some(entry) = removed {
            entry.producer.release(self);
        }
    }

    /// The task registered for `spec` and its producer, with a reference on the
    /// producer for the caller.
    pub(crate) fn get_tasks_producing(
        &mut self,
        spec: &ValueSpecification,
    ) -> Option<(Arc<ResolveTask>, ProducerRef)> {
        self.state
            .specifications
            .with_existing(spec, |slot| {
                slot.as_ref().and_then(|entry| {
                    entry
                        .producer
                        .core()
                        .add_ref()
                        .then(|| (entry.task.clone(), entry.producer.clone()))
                })
            })
            .flatten()
    }

    pub(crate) fn get_production(&self, spec: &ValueSpecification) -> Option<Arc<ResolvedValue>> {
        self.state.terminal.get_production(spec)
    }

    pub(crate) fn declare_production(&self, value: Arc<ResolvedValue>) {
        self.state.terminal.declare_production(value);
    }

    // Collaborators.

    pub(crate) fn resolve_target(&self, reference: &TargetReference) -> Option<TargetSpecification> {
        self.state.compilation_context.target_resolver.resolve(reference)
    }

    pub(crate) fn market_data_availability(
        &self,
        target: &TargetSpecification,
        requirement: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, AvailabilityError> {
        self.state.market_data.get_availability(target, requirement)
    }

    pub(crate) fn resolve_functions(
        &mut self,
        requirement: &ValueRequirement,
        target: &TargetSpecification,
    ) -> Option<CandidateIter> {
        let functions = &self.state.functions;
        let result = guarded(|| {
            functions.resolve_function(requirement.name(), target, requirement.constraints())
        });
        match result {
            Ok(candidates) => Some(candidates),
            Err(source) => {
                error!(%requirement, "function catalog failed: {source:#}");
                self.state.record_exception(&ResolutionError::Catalog {
                    requirement: requirement.clone(),
                    source,
                });
                None
            }
        }
    }

    /// Runs one call into a function definition. Errors and panics count as
    /// "cannot proceed" and are kept for reporting.
    pub(crate) fn call_function<T>(
        &mut self,
        call: &'static str,
        function: &ParameterizedFunction,
        f: impl FnOnce(&CompilationContext) -> anyhow::Result<Option<T>>,
    ) -> Option<T> {
        let context: &CompilationContext = &self.state.compilation_context;
        match guarded(|| f(context)) {
            Ok(result) => result,
            Err(source) => {
                error!(%function, call, "function failed: {source:#}");
                self.state.record_exception(&ResolutionError::Collaborator {
                    call,
                    function: function.to_string(),
                    source,
                });
                None
            }
        }
    }

    /// Whether `function` belongs to a group already used on the task's path.
    pub(crate) fn is_excluded(&self, task: &ResolveTask, function: &ParameterizedFunction) -> bool {
        let (Some(excluded), Some(groups)) = (
            task.exclusion(),
            &self.state.compilation_context.exclusion_groups,
        ) else {
            return false;
        };
        groups
            .exclusion_group(function)
            .is_some_and(|group| excluded.contains(&group))
    }

    /// Exclusion set for an input of `function`. Only an input asking for the
    /// same value on the same target carries the groups forward.
    pub(crate) fn input_exclusion(
        &self,
        task: &ResolveTask,
        function: &ParameterizedFunction,
        input: &ValueRequirement,
        target: &TargetSpecification,
    ) -> Option<ExclusionSet> {
        if input.name() != task.requirement().name() || !input.target().refers_to(target) {
            return None;
        }
        let group = self
            .state
            .compilation_context
            .exclusion_groups
            .as_ref()
            .and_then(|groups| groups.exclusion_group(function));
        match group {
            None => task.exclusion().cloned(),
            Some(group) => {
                let mut set: BTreeSet<_> = task
                    .exclusion()
                    .map(|set| (**set).clone())
                    .unwrap_or_default();
                set.insert(group);
                Some(Arc::new(set))
            }
        }
    }

    pub(crate) fn is_blacklisted(
        &self,
        function: &ParameterizedFunction,
        target: &TargetSpecification,
        inputs: &BTreeSet<ValueSpecification>,
        outputs: &BTreeSet<ValueSpecification>,
    ) -> bool {
        self.state
            .compilation_context
            .blacklist
            .is_blacklisted(function, target, inputs, outputs)
    }

    // Failure factories. All of them return `None` when failure reporting is
    // off, so nothing is allocated.

    fn failure(&self, requirement: &ValueRequirement, event: FailureEvent) -> Option<ResolutionFailure> {
        (!self.state.config.disable_failure_reporting)
            .then(|| ResolutionFailure::new(requirement.clone(), event))
    }

    pub(crate) fn recursive_requirement(&self, requirement: &ValueRequirement) -> Option<ResolutionFailure> {
        self.failure(requirement, FailureEvent::RecursiveRequirement)
    }

    pub(crate) fn could_not_resolve(&self, requirement: &ValueRequirement) -> Option<ResolutionFailure> {
        self.failure(requirement, FailureEvent::CouldNotResolve)
    }

    pub(crate) fn no_functions(&self, requirement: &ValueRequirement) -> Option<ResolutionFailure> {
        self.failure(requirement, FailureEvent::NoFunctions)
    }

    pub(crate) fn market_data_missing(&self, requirement: &ValueRequirement) -> Option<ResolutionFailure> {
        self.failure(requirement, FailureEvent::MarketDataMissing)
    }

    pub(crate) fn function_application(
        &self,
        requirement: &ValueRequirement,
        function: &ParameterizedFunction,
        output: &ValueSpecification,
    ) -> Option<FunctionApplication> {
        (!self.state.config.disable_failure_reporting).then(|| {
            FunctionApplication::new(requirement.clone(), function.node_function(), output.clone())
        })
    }
}

enum Deferred {
    Resolved(Arc<ResolvedValue>, Option<ResolutionPump>),
    Failed(Option<ResolutionFailure>),
}

/// A callback delivery that went past the depth limit.
struct DeferredCallback {
    callback: CallbackRef,
    requirement: ValueRequirement,
    delivery: Mutex<Option<Deferred>>,
}

impl ContextRunnable for DeferredCallback {
    fn try_run(&self, ctx: &mut GraphBuildingContext) -> bool {
        let delivery = self.delivery.lock().unwrap().take();
        match delivery {
            Some(Deferred::Resolved(value, pump)) => ctx.resolved(&self.callback, &self.requirement, value, pump),
            Some(Deferred::Failed(failure)) => ctx.failed(&self.callback, &self.requirement, failure),
            None => {}
        }
        true
    }

    fn label(&self) -> String {
        format!("deliver {}", self.requirement)
    }
}

/// A pump or close that went past the depth limit.
struct DeferredPump {
    pump: ResolutionPump,
    close: bool,
}

impl ContextRunnable for DeferredPump {
    fn try_run(&self, ctx: &mut GraphBuildingContext) -> bool {
        if self.close {
            ctx.close(&self.pump);
        } else {
            ctx.pump(&self.pump);
        }
        true
    }

    fn label(&self) -> String {
        let verb = if self.close { "close" } else { "pump" };
        format!("{verb} {}", self.pump.producer().requirement())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::DependencyGraphBuilder;
    use crate::function::{FunctionRepository, NoMarketData};

    /// A context over an empty builder with no background threads, so nothing
    /// submitted runs unless a test drives it.
    pub(crate) fn test_context() -> GraphBuildingContext {
        let builder = DependencyGraphBuilder::setup()
            .market_data(Arc::new(NoMarketData))
            .functions(FunctionRepository::new().into_resolver())
            .max_additional_threads(0)
            .finish()
            .unwrap();
        builder.context()
    }

    fn requirement(name: &str) -> ValueRequirement {
        ValueRequirement::of(name, TargetSpecification::primitive("T"))
    }

    #[test]
    fn test_recursive_requirement_is_refused() {
        let mut ctx = test_context();
        let parent = ResolveTask::new(requirement("A"), None, None);
        let child = ResolveTask::new(requirement("B"), Some(&parent), None);

        assert!(ctx.resolve_requirement(&requirement("A"), Some(&child), None).is_none());
        assert!(child.core().was_recursion_detected());
        assert!(ctx.resolve_requirement(&requirement("C"), Some(&child), None).is_some());
    }

    #[test]
    fn test_equivalent_requirements_share_a_task() {
        let mut ctx = test_context();
        let first = ctx.resolve_requirement(&requirement("A"), None, None).unwrap();
        let second = ctx.resolve_requirement(&requirement("A"), None, None).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        // two callers and the cache
        assert_eq!(first.core().ref_count(), 3);
        assert_eq!(ctx.state().run_queue.len(), 1);
    }

    #[test]
    fn test_one_producer_per_specification() {
        let mut ctx = test_context();
        let spec = ValueSpecification::new(
            "A",
            TargetSpecification::primitive("T"),
            crate::value::ValueProperties::none(),
        );
        let owner = ResolveTask::new(requirement("A"), None, None);
        let other = ResolveTask::new(requirement("X"), None, None);
        let child = ResolveTask::new(requirement("B"), Some(&owner), None);
        let producer = crate::engine::producer::tests::ManualProducer::new(requirement("A"));

        assert!(matches!(
            ctx.declare_task_producing(&spec, &owner, producer.clone()),
            Declared::Producer
        ));
        assert_eq!(producer.core().ref_count(), 2);

        match ctx.declare_task_producing(&spec, &other, producer.clone()) {
            Declared::Existing(existing) => {
                assert_eq!(existing.core().id(), producer.core().id());
                existing.release(&mut ctx);
            }
            _ => panic!("expected the registered producer"),
        }
        assert!(matches!(
            ctx.declare_task_producing(&spec, &child, producer.clone()),
            Declared::Recursive
        ));

        // only the registering task can withdraw
        ctx.discard_task_producing(&spec, &other);
        assert!(ctx.get_tasks_producing(&spec).is_some_and(|(_, p)| p.release(&mut ctx) == 2));
        ctx.discard_task_producing(&spec, &owner);
        assert!(ctx.get_tasks_producing(&spec).is_none());
        assert_eq!(producer.core().ref_count(), 1);
    }

    #[test]
    fn test_disabled_reporting_builds_no_failures() {
        let mut ctx = test_context();
        assert!(ctx.no_functions(&requirement("A")).is_some());

        let builder = DependencyGraphBuilder::setup()
            .market_data(Arc::new(NoMarketData))
            .functions(FunctionRepository::new().into_resolver())
            .max_additional_threads(0)
            .disable_failure_reporting(true)
            .finish()
            .unwrap();
        ctx = builder.context();
        assert!(ctx.no_functions(&requirement("A")).is_none());
        assert!(ctx.recursive_requirement(&requirement("A")).is_none());
    }
}
