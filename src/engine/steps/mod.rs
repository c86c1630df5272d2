//! The states a [`ResolveTask`] moves through.
//!
//! Starting from [`GetFunctionsStep`] the task looks at market data, then walks
//! the candidate functions in [`NextFunctionStep`]. Each candidate either joins
//! an existing production ([`ExistingProductionStep`], [`DelegateStep`]) or is
//! applied ([`FunctionApplicationStep`], then [`PumpingStep`] while its inputs
//! resolve). Steps replace each other with a compare-and-set on the task, so a
//! step that lost a race simply stops.
mod apply;
mod delegate;
mod get_functions;
mod next_function;

use std::sync::Arc;

use tracing::debug;

use crate::engine::{GraphBuildingContext, ResolveTask};

pub(crate) use apply::{FunctionApplicationStep, PumpingStep};
pub(crate) use delegate::{DelegateStep, SubstituteDelegateStep};
pub(crate) use get_functions::GetFunctionsStep;
pub(crate) use next_function::{ExistingProductionStep, NextFunctionStep};

#[derive(Clone)]
pub(crate) enum TaskState {
    GetFunctions(Arc<GetFunctionsStep>),
    NextFunction(Arc<NextFunctionStep>),
    ExistingProduction(Arc<ExistingProductionStep>),
    Delegate(Arc<DelegateStep>),
    ApplyFunction(Arc<FunctionApplicationStep>),
    Pumping(Arc<PumpingStep>),
    SubstituteDelegate(Arc<SubstituteDelegateStep>),
}

impl TaskState {
    pub(crate) fn initial() -> Self {
        TaskState::GetFunctions(Arc::new(GetFunctionsStep))
    }

    fn address(&self) -> *const () {
        match self {
            TaskState::GetFunctions(step) => Arc::as_ptr(step) as *const (),
            TaskState::NextFunction(step) => Arc::as_ptr(step) as *const (),
            TaskState::ExistingProduction(step) => Arc::as_ptr(step) as *const (),
            TaskState::Delegate(step) => Arc::as_ptr(step) as *const (),
            TaskState::ApplyFunction(step) => Arc::as_ptr(step) as *const (),
            TaskState::Pumping(step) => Arc::as_ptr(step) as *const (),
            TaskState::SubstituteDelegate(step) => Arc::as_ptr(step) as *const (),
        }
    }

    /// Identity, not equality.
    pub(crate) fn same(&self, other: &TaskState) -> bool {
        std::ptr::eq(self.address(), other.address())
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskState::GetFunctions(_) => "get-functions",
            TaskState::NextFunction(_) => "next-function",
            TaskState::ExistingProduction(_) => "existing-production",
            TaskState::Delegate(_) => "delegate",
            TaskState::ApplyFunction(_) => "apply-function",
            TaskState::Pumping(_) => "pumping",
            TaskState::SubstituteDelegate(_) => "substitute-delegate",
        }
    }

    /// Runs a queued step. `false` asks for the task to be retried later.
    pub(crate) fn run(&self, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) -> bool {
        match self {
            TaskState::GetFunctions(step) => step.run(task, ctx),
            TaskState::NextFunction(step) => step.run(task, ctx),
            TaskState::ApplyFunction(step) => step.run(task, ctx),
            _ => {
                debug!(state = self.name(), "task queued in a waiting state");
                true
            }
        }
    }

    /// A subscriber of the task wants another result.
    pub(crate) fn pump(&self, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) {
        match self {
            TaskState::ExistingProduction(step) => step.pump(task, ctx),
            TaskState::Delegate(step) => step.pump(task, ctx),
            TaskState::Pumping(step) => step.pump(ctx),
            TaskState::SubstituteDelegate(step) => step.pump(task, ctx),
            // Still running, the result it is working towards is the answer.
            TaskState::GetFunctions(_) | TaskState::NextFunction(_) | TaskState::ApplyFunction(_) => {}
        }
    }

    /// The task was dropped while in this state.
    pub(crate) fn discard(&self, task: &ResolveTask, ctx: &mut GraphBuildingContext) {
        match self {
            TaskState::Delegate(step) => step.discard(ctx),
            TaskState::Pumping(step) => step.discard(task, ctx),
            TaskState::SubstituteDelegate(step) => step.discard(task, ctx),
            _ => {}
        }
    }
}
