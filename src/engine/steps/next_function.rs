use std::iter::Peekable;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::engine::steps::{DelegateStep, FunctionApplicationStep, TaskState};
use crate::engine::{GraphBuildingContext, ResolveTask, ResolvedValueProducer};
use crate::function::CandidateIter;
use crate::value::TargetSpecification;

/// Walks the candidate functions, best first.
///
/// This is the state every later step falls back to when its candidate is
/// exhausted, so it holds the candidate iterator for the whole life of the
/// task.
pub(crate) struct NextFunctionStep {
    task: Weak<ResolveTask>,
    target: TargetSpecification,
    functions: Mutex<Peekable<CandidateIter>>,
}

impl NextFunctionStep {
    pub(crate) fn new(task: Weak<ResolveTask>, target: TargetSpecification, functions: Peekable<CandidateIter>) -> Self {
        Self {
            task,
            target,
            functions: Mutex::new(functions),
        }
    }

    pub(crate) fn target(&self) -> &TargetSpecification {
        &self.target
    }

    /// Makes this the task's state again and schedules it.
    pub(crate) fn resume(self: &Arc<Self>, from: &TaskState, ctx: &mut GraphBuildingContext) {
        if let Some(task) = self.task.upgrade() {
            task.set_runnable_state(from, TaskState::NextFunction(self.clone()), ctx);
        }
    }

    pub(crate) fn run(self: &Arc<Self>, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) -> bool {
        let this_state = TaskState::NextFunction(self.clone());
        let requirement = task.requirement().clone();

        loop {
            let candidate = self.functions.lock().unwrap().next();
            let Some(candidate) = candidate else {
                info!(%requirement, "no more functions");
                task.finish(ctx);
                return true;
            };

            if ctx.is_excluded(task, &candidate.function) {
                debug!(%requirement, function = %candidate.function, "function excluded");
                continue;
            }

            let resolved_output = candidate.output.compose(&requirement);

            if let Some((owner, producer)) = ctx.get_tasks_producing(&resolved_output) {
                if task.descends_from(&owner) {
                    producer.release(ctx);
                    debug!(%requirement, spec = %resolved_output, "already being produced by an ancestor");
                    task.set_recursion_detected();
                    task.store_failure(ctx.recursive_requirement(&requirement).as_ref());
                    continue;
                }
                debug!(%requirement, spec = %resolved_output, "delegating to existing production");
                let delegate = DelegateStep::new(Arc::downgrade(task), self.clone());
                if task.set_state(&this_state, TaskState::Delegate(delegate.clone())) {
                    delegate.subscribe(ctx, &producer);
                }
                producer.release(ctx);
                return true;
            }

            if let Some(existing) = ctx.get_production(&resolved_output) {
                debug!(%requirement, spec = %resolved_output, "reusing finished production");
                let waiting = TaskState::ExistingProduction(Arc::new(ExistingProductionStep::new(self.clone())));
                if !task.set_state(&this_state, waiting.clone()) {
                    return true;
                }
                if task.push_result(ctx, existing, false) {
                    return true;
                }
                // Not new to this task. Carry on unless a pump already did.
                if task.set_state(&waiting, this_state.clone()) {
                    continue;
                }
                return true;
            }

            let apply = Arc::new(FunctionApplicationStep::new(self.clone(), candidate, resolved_output));
            if task.set_state(&this_state, TaskState::ApplyFunction(apply.clone())) {
                return apply.run(task, ctx);
            }
            return true;
        }
    }
}

/// A finished production was handed out; the next pump moves on to the next
/// candidate.
pub(crate) struct ExistingProductionStep {
    base: Arc<NextFunctionStep>,
}

impl ExistingProductionStep {
    pub(crate) fn new(base: Arc<NextFunctionStep>) -> Self {
        Self { base }
    }

    pub(crate) fn pump(self: &Arc<Self>, _task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) {
        self.base
            .resume(&TaskState::ExistingProduction(self.clone()), ctx);
    }
}
