use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::engine::steps::TaskState;
use crate::engine::{
    ContextRunnable, GraphBuildingContext, ProducerCore, ResolvedValueProducer, RunPriority,
};
use crate::failure::ResolutionFailure;
use crate::function::FunctionExclusionGroup;
use crate::value::{ResolvedValue, ValueRequirement};

pub(crate) type ExclusionSet = Arc<BTreeSet<FunctionExclusionGroup>>;

/// Identifies a task among those resolving the same requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    ancestors: Arc<BTreeSet<ValueRequirement>>,
    exclusion: Option<ExclusionSet>,
}

impl TaskKey {
    /// A task can answer for another when it prunes no more than the other
    /// would: same exclusions and no ancestor the other lacks.
    pub(crate) fn can_stand_in_for(&self, other: &TaskKey) -> bool {
        self.exclusion == other.exclusion && self.ancestors.is_subset(&other.ancestors)
    }
}

/// Searches for resolutions of one requirement, one step at a time.
///
/// The task never resolves a requirement that is already on its path from a
/// top-level requirement, which is how direct recursion is cut off.
pub(crate) struct ResolveTask {
    core: ProducerCore,
    this: Weak<ResolveTask>,
    key: TaskKey,
    state: Mutex<Option<TaskState>>,
}

impl ResolveTask {
    pub(crate) fn new(
        requirement: ValueRequirement,
        parent: Option<&Arc<ResolveTask>>,
        exclusion: Option<ExclusionSet>,
    ) -> Arc<Self> {
        let ancestors = match parent {
            Some(parent) => {
                let mut ancestors = (*parent.key.ancestors).clone();
                ancestors.insert(parent.requirement().clone());
                Arc::new(ancestors)
            }
            None => Arc::new(BTreeSet::new()),
        };
        Arc::new_cyclic(|this: &Weak<ResolveTask>| Self {
            core: ProducerCore::new(requirement, this.clone()),
            this: this.clone(),
            key: TaskKey {
                ancestors,
                exclusion,
            },
            state: Mutex::new(Some(TaskState::initial())),
        })
    }

    pub(crate) fn key(&self) -> &TaskKey {
        &self.key
    }

    pub(crate) fn exclusion(&self) -> Option<&ExclusionSet> {
        self.key.exclusion.as_ref()
    }

    /// Whether `requirement` is this task's own or one of its ancestors'.
    pub(crate) fn has_parent(&self, requirement: &ValueRequirement) -> bool {
        self.requirement() == requirement || self.key.ancestors.contains(requirement)
    }

    /// Whether `other` sits on this task's path from its top-level requirement.
    pub(crate) fn descends_from(&self, other: &ResolveTask) -> bool {
        std::ptr::eq(self, other) || self.key.ancestors.contains(other.requirement())
    }

    pub(crate) fn arc(&self) -> Option<Arc<ResolveTask>> {
        self.this.upgrade()
    }

    pub(crate) fn state(&self) -> Option<TaskState> {
        self.state.lock().unwrap().clone()
    }

    /// Moves from `previous` to `next`, unless something else has moved the
    /// task on in the meantime.
    pub(crate) fn set_state(&self, previous: &TaskState, next: TaskState) -> bool {
        let mut state = self.state.lock().unwrap();
        match &*state {
            Some(current) if current.same(previous) => {
                trace!(
                    task = self.core.id(),
                    from = previous.name(),
                    to = next.name(),
                    "task state"
                );
                *state = Some(next);
                true
            }
            _ => {
                debug!(task = self.core.id(), expected = previous.name(), "stale state transition");
                false
            }
        }
    }

    /// [`Self::set_state`], then schedules the task to run the new state.
    pub(crate) fn set_runnable_state(
        self: &Arc<Self>,
        previous: &TaskState,
        next: TaskState,
        ctx: &mut GraphBuildingContext,
    ) -> bool {
        if self.set_state(previous, next) {
            ctx.run(self.clone());
            true
        } else {
            false
        }
    }

    pub(crate) fn push_result(&self, ctx: &mut GraphBuildingContext, value: Arc<ResolvedValue>, last: bool) -> bool {
        self.core.push_result(ctx, value, last)
    }

    pub(crate) fn store_failure(&self, failure: Option<&ResolutionFailure>) {
        self.core.store_failure(failure);
    }

    pub(crate) fn set_recursion_detected(&self) {
        self.core.set_recursion_detected();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    /// No more candidates: leaves the state machine and notifies waiting
    /// subscribers.
    pub(crate) fn finish(&self, ctx: &mut GraphBuildingContext) {
        self.state.lock().unwrap().take();
        debug!(task = self.core.id(), requirement = %self.requirement(), "task finished");
        self.core.finished(ctx);
    }
}

impl ResolvedValueProducer for ResolveTask {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn pump_impl(&self, ctx: &mut GraphBuildingContext) {
        let (Some(this), Some(state)) = (self.arc(), self.state()) else {
            return;
        };
        state.pump(&this, ctx);
    }

    fn discard(&self, ctx: &mut GraphBuildingContext) {
        let state = self.state.lock().unwrap().take();
        if let Some(state) = state {
            debug!(task = self.core.id(), state = state.name(), "discarding task");
            state.discard(self, ctx);
        }
    }

    /// With only the cache left holding an unfinished task nobody wants its
    /// results, so it is dropped from the cache too.
    fn release(&self, ctx: &mut GraphBuildingContext) -> usize {
        match self.core.release_ref() {
            Some(0) => {
                self.discard(ctx);
                0
            }
            Some(1) if !self.core.is_finished() => {
                if let Some(this) = self.arc() {
                    ctx.discard_task(&this);
                }
                1
            }
            Some(count) => count,
            None => 0,
        }
    }
}

impl ContextRunnable for ResolveTask {
    fn try_run(&self, ctx: &mut GraphBuildingContext) -> bool {
        let (Some(this), Some(state)) = (self.arc(), self.state()) else {
            return true;
        };
        state.run(&this, ctx)
    }

    fn priority(&self) -> Option<RunPriority> {
        let requirement = self.requirement();
        Some(RunPriority {
            target: requirement.target().specification()?.clone(),
            value_name: requirement.name().into(),
        })
    }

    fn label(&self) -> String {
        format!("resolve {}", self.requirement())
    }
}
