use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::steps::{NextFunctionStep, TaskState};
use crate::engine::{GraphBuildingContext, ResolveTask, ResolvedValueProducer};
use crate::error::AvailabilityError;
use crate::function::market_data_value;

/// First step of every task: resolve the target, look for market data, then
/// fetch the candidate functions.
pub(crate) struct GetFunctionsStep;

impl GetFunctionsStep {
    pub(crate) fn run(self: &Arc<Self>, task: &Arc<ResolveTask>, ctx: &mut GraphBuildingContext) -> bool {
        let requirement = task.requirement().clone();

        let Some(target) = ctx.resolve_target(requirement.target()) else {
            info!(%requirement, "couldn't resolve target");
            task.store_failure(ctx.could_not_resolve(&requirement).as_ref());
            task.finish(ctx);
            return true;
        };

        match ctx.market_data_availability(&target, &requirement) {
            Err(AvailabilityError::WouldBlock) => {
                debug!(%requirement, "market data availability not known yet, deferring");
                return false;
            }
            Err(AvailabilityError::NotSatisfiable) => {
                info!(%requirement, "market data is missing");
                task.store_failure(ctx.market_data_missing(&requirement).as_ref());
                task.finish(ctx);
                return true;
            }
            Ok(Some(spec)) => {
                debug!(%requirement, %spec, "found in market data");
                let value = Arc::new(market_data_value(spec));
                ctx.declare_production(value.clone());
                if !task.push_result(ctx, value, true) {
                    // Only a discarded task refuses its first result.
                    debug!(%requirement, "market data result not accepted");
                }
                task.finish(ctx);
                return true;
            }
            Ok(None) => {}
        }

        let mut functions = ctx
            .resolve_functions(&requirement, &target)
            .unwrap_or_else(|| Box::new(std::iter::empty()))
            .peekable();
        if functions.peek().is_none() {
            info!(%requirement, "no functions available");
            task.store_failure(ctx.no_functions(&requirement).as_ref());
            task.finish(ctx);
            return true;
        }

        let next = Arc::new(NextFunctionStep::new(Arc::downgrade(task), target, functions));
        if task.set_state(&TaskState::GetFunctions(self.clone()), TaskState::NextFunction(next.clone())) {
            return next.run(task, ctx);
        }
        true
    }
}
