//! The public entry point: collects top-level requirements, drives the
//! resolution engine over them and hands back the finished graph.
mod cleanup;
pub(crate) mod job;
mod pending;
mod setup;
mod state;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{Level, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{CallbackRef, GraphBuildingContext, ProducerRef, SingleResolvedValueProducer};
use crate::error::{BuildError, ResolutionError};
use crate::failure::ResolutionFailureListener;
use crate::graph::DependencyGraph;
use crate::value::{ValueRequirement, ValueSpecification};

pub use cleanup::{CacheCleanupPolicy, CacheStats, EntryCountPolicy, NoCleanup};
pub use setup::{BuilderConfig, BuilderSetup};
pub(crate) use state::BuilderState;

/// How long a caller waiting for background jobs sleeps between checks.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Builds a dependency graph for a set of top-level requirements.
///
/// Requirements can be added at any time, resolution starts straight away on
/// the background threads. A caller asking for the graph joins the work until
/// nothing is left to do.
pub struct DependencyGraphBuilder {
    state: Arc<BuilderState>,
}

impl DependencyGraphBuilder {
    pub fn setup() -> BuilderSetup {
        BuilderSetup::default()
    }

    pub(crate) fn from_state(state: BuilderState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn context(&self) -> GraphBuildingContext {
        GraphBuildingContext::new(self.state.clone())
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.state.config
    }

    pub fn add_target(&self, requirement: ValueRequirement) {
        self.add_targets([requirement]);
    }

    /// Queues requirements for resolution. Never blocks on the build.
    pub fn add_targets(&self, requirements: impl IntoIterator<Item = ValueRequirement>) {
        let mut ctx = self.context();
        {
            let _guard = self.state.build_lock.lock().unwrap();
            for requirement in requirements {
                self.state.pending.add(&requirement);
                let producer = match self.state.terminal.previous_resolution(&requirement) {
                    Some(value) => {
                        debug!(%requirement, "satisfied by the previous graph");
                        Some(SingleResolvedValueProducer::new(&mut ctx, requirement.clone(), value) as ProducerRef)
                    }
                    None => ctx.resolve_requirement(&requirement, None, None),
                };
                let Some(producer) = producer else {
                    warn!(%requirement, "no producer for top-level requirement");
                    self.state.pending.remove(&requirement);
                    continue;
                };
                producer
                    .core()
                    .add_callback(&mut ctx, self.state.terminal.clone() as CallbackRef);
                producer.release(&mut ctx);
            }
        }
        job::start_job(&self.state);
    }

    /// Blocks until every requirement added so far has been answered.
    pub fn get_dependency_graph(&self) -> Result<DependencyGraph, BuildError> {
        self.get_dependency_graph_with(true)?.ok_or(BuildError::Cancelled)
    }

    /// Joins the build on the calling thread. Without
    /// `allow_background_continuation` this returns `Ok(None)` as soon as the
    /// caller runs out of work while background jobs are still busy.
    pub fn get_dependency_graph_with(
        &self,
        allow_background_continuation: bool,
    ) -> Result<Option<DependencyGraph>, BuildError> {
        if !self.wait_for(allow_background_continuation)? {
            return Ok(None);
        }
        Ok(Some(self.graph()))
    }

    /// Blocks until the graph can be taken without blocking. Large graphs can
    /// be built in batches this way, keeping less resolution state around.
    pub fn wait_for_build(&self) -> Result<(), BuildError> {
        self.wait_for(true).map(|_| ())
    }

    fn wait_for(&self, allow_background_continuation: bool) -> Result<bool, BuildError> {
        if self.is_graph_built()? {
            return Ok(true);
        }

        let span = tracing::span!(Level::INFO, "building_graph");
        span.pb_set_style(&crate::utils::progress_style());
        span.pb_set_message("Resolving requirements...");
        let _enter = span.enter();
        info!("building dependency graph");

        loop {
            let completed = job::run_inline(&self.state, &span)?;
            debug!(completed, "caller finished its share");
            if !self.state.run_queue.is_empty() {
                continue;
            }
            if !allow_background_continuation {
                return self.is_graph_built();
            }

            // With only deferred work left the wait runs its full interval,
            // so units that could not progress are not retried in a spin.
            let guard = self.state.build_lock.lock().unwrap();
            let (guard, _) = self
                .state
                .build_signal
                .wait_timeout_while(guard, WAIT_INTERVAL, |_| {
                    !self.state.is_cancelled()
                        && self.state.run_queue.is_empty()
                        && (self.state.running.load(Ordering::Acquire) > 0 || self.state.has_deferred())
                })
                .unwrap();
            drop(guard);

            if self.is_graph_built()? {
                return Ok(true);
            }
            if self.state.running.load(Ordering::Acquire) == 0 {
                job::retry_deferred(&self.state);
            }
        }
    }

    /// The graph if the build is complete, `None` while work remains.
    pub fn poll_dependency_graph(&self) -> Result<Option<DependencyGraph>, BuildError> {
        Ok(self.is_graph_built()?.then(|| self.graph()))
    }

    /// No job running and no work queued.
    pub fn is_graph_built(&self) -> Result<bool, BuildError> {
        if self.state.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let _guard = self.state.build_lock.lock().unwrap();
        Ok(self.state.is_idle())
    }

    fn graph(&self) -> DependencyGraph {
        let graph = self
            .state
            .terminal
            .graph(&self.state.config.calculation_configuration);
        info!(
            nodes = graph.node_count(),
            terminal = graph.terminal_outputs().len(),
            "dependency graph built"
        );
        if self.state.config.dump_dependency_graph {
            match graph.to_json() {
                Ok(json) => debug!(%json, "dependency graph"),
                Err(err) => warn!(%err, "couldn't serialize dependency graph"),
            }
        }
        graph
    }

    /// Stops the build for good. Running jobs finish their current step,
    /// callers blocked on the graph get [`BuildError::Cancelled`].
    pub fn cancel(&self) {
        let _guard = self.state.build_lock.lock().unwrap();
        info!("cancelling graph build");
        self.state.cancelled.store(true, Ordering::Release);
        self.state.max_jobs.store(0, Ordering::Release);
        self.state.build_signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Top-level requirements with neither a result nor a failure yet.
    pub fn outstanding_requirements(&self) -> Vec<ValueRequirement> {
        self.state.pending.outstanding()
    }

    /// Completed over scheduled steps. Both grow as resolution discovers more
    /// work, so the estimate can go down as well as up.
    pub fn build_fraction_estimate(&self) -> f64 {
        let scheduled = self.state.scheduled_steps.load(Ordering::Relaxed);
        if scheduled == 0 {
            return 1.0;
        }
        let completed = self.state.completed_steps.load(Ordering::Relaxed);
        (completed as f64 / scheduled as f64).clamp(0.0, 1.0)
    }

    pub fn set_resolution_failure_listener(&self, listener: Arc<dyn ResolutionFailureListener>) {
        self.state.terminal.set_failure_listener(listener);
    }

    /// Terminal specifications placed so far and the requirements they satisfy.
    pub fn value_requirement_mapping(&self) -> BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        self.state.terminal.value_requirement_mapping()
    }

    /// Every problem met during resolution by message, with occurrence counts.
    pub fn exceptions(&self) -> BTreeMap<String, usize> {
        self.state.exceptions()
    }

    /// Top-level requirements that could not be satisfied.
    pub fn unsatisfied(&self) -> Vec<ResolutionError> {
        self.state.terminal.unsatisfied()
    }

    /// Changes the number of background jobs. Raising it puts idle work on the
    /// new jobs straight away.
    pub fn set_max_additional_threads(&self, threads: usize) {
        if self.state.is_cancelled() {
            return;
        }
        self.state.max_jobs.store(threads, Ordering::Release);
        job::start_background_build(&self.state);
    }

    /// Starts from a graph built earlier. Requirements it already satisfies
    /// resolve to its nodes and its values are reused as productions.
    pub fn set_dependency_graph(&self, previous: &DependencyGraph) {
        let _guard = self.state.build_lock.lock().unwrap();
        self.state.terminal.populate(previous);
    }
}
