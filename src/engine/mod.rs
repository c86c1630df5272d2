//! The resolution engine: producers of resolved values, the tasks that search
//! for them and the context every unit of work runs in.
//!
//! Every object that can answer a requirement is a [`ResolvedValueProducer`].
//! Consumers subscribe with a [`ResolvedValueCallback`] and receive results one
//! at a time; after each result they hold a [`ResolutionPump`] which asks the
//! producer for the next alternative. Producers are reference counted on top of
//! their `Arc` so that abandoned work can be discarded early.
mod aggregate;
mod cache;
mod context;
mod loops;
mod producer;
pub(crate) mod run_queue;
mod single;
mod steps;
mod task;
mod worker;

use std::sync::Arc;

use crate::failure::ResolutionFailure;
use crate::value::{ResolvedValue, ValueRequirement};

pub(crate) use aggregate::AggregateResolvedValueProducer;
pub(crate) use cache::{Cache, RequirementEntry, SpecificationEntry};
pub(crate) use context::GraphBuildingContext;
pub(crate) use loops::abort_loops;
pub(crate) use producer::ProducerCore;
pub(crate) use run_queue::{RunPriority, RunQueue};
pub(crate) use single::SingleResolvedValueProducer;
pub(crate) use task::{ExclusionSet, ResolveTask, TaskKey};
pub(crate) use worker::FunctionApplicationWorker;

pub(crate) type ProducerRef = Arc<dyn ResolvedValueProducer>;
pub(crate) type CallbackRef = Arc<dyn ResolvedValueCallback>;
pub(crate) type Runnable = Arc<dyn ContextRunnable>;

/// Receives the results of one subscription.
pub(crate) trait ResolvedValueCallback: Send + Sync {
    /// A new result. `pump` is `None` when this was the last one.
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    );

    /// No further results. Ends the subscription.
    fn failed(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        failure: Option<ResolutionFailure>,
    );

    /// Called before `failed` when the failure involved a recursion guard.
    fn recursion_detected(&self);

    /// The producer blocked while this subscription waits, if any.
    fn owner(&self) -> Option<ProducerRef> {
        None
    }
}

pub(crate) trait ResolvedValueProducer: Send + Sync {
    fn core(&self) -> &ProducerCore;

    /// Asked for another result. Either pushes one, finishes, or arranges for
    /// one of those to happen later.
    fn pump_impl(&self, ctx: &mut GraphBuildingContext);

    /// The logical reference count reached zero.
    fn discard(&self, _ctx: &mut GraphBuildingContext) {}

    /// Drops one logical reference, returning the remaining count. The discard
    /// hook runs on the release that takes the count to zero, never again.
    fn release(&self, ctx: &mut GraphBuildingContext) -> usize {
        match self.core().release_ref() {
            Some(0) => {
                self.discard(ctx);
                0
            }
            Some(count) => count,
            None => 0,
        }
    }

    /// Producers that cannot progress until this one does, beyond the owners
    /// of waiting subscriptions.
    fn blocked_dependents(&self) -> Vec<ProducerRef> {
        Vec::new()
    }

    fn requirement(&self) -> &ValueRequirement {
        self.core().requirement()
    }
}

/// A unit of work for the run queue.
pub(crate) trait ContextRunnable: Send + Sync {
    /// `false` means the work could not make progress yet and should be retried
    /// after other work has run.
    fn try_run(&self, ctx: &mut GraphBuildingContext) -> bool;

    fn priority(&self) -> Option<RunPriority> {
        None
    }

    fn label(&self) -> String;
}

/// Handle to one subscription, used to request the next result or to give up.
#[derive(Clone)]
pub(crate) struct ResolutionPump {
    producer: ProducerRef,
    subscription: u64,
}

impl ResolutionPump {
    pub(crate) fn new(producer: ProducerRef, subscription: u64) -> Self {
        Self {
            producer,
            subscription,
        }
    }

    pub(crate) fn producer(&self) -> &ProducerRef {
        &self.producer
    }

    pub(crate) fn subscription(&self) -> u64 {
        self.subscription
    }

    pub(crate) fn pump(&self, ctx: &mut GraphBuildingContext) {
        self.producer.core().pump(ctx, self.subscription);
    }

    pub(crate) fn close(&self, ctx: &mut GraphBuildingContext) {
        self.producer.core().close(ctx, self.subscription);
    }
}

impl std::fmt::Debug for ResolutionPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionPump")
            .field("producer", &self.producer.core().id())
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Address of a producer, stable for as long as the `Arc` lives.
pub(crate) fn producer_key(producer: &ProducerRef) -> usize {
    Arc::as_ptr(producer) as *const () as usize
}
