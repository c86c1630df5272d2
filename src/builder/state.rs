use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::builder::cleanup::CacheCleanupPolicy;
use crate::builder::pending::PendingRequirements;
use crate::builder::setup::BuilderConfig;
use crate::engine::{
    Cache, GraphBuildingContext, ProducerRef, RequirementEntry, ResolvedValueProducer, RunQueue, Runnable,
    SpecificationEntry,
};
use crate::error::{BuildError, ResolutionError};
use crate::function::{CompilationContext, FunctionResolver, MarketDataAvailabilityProvider};
use crate::graph::GetTerminalValuesCallback;
use crate::value::{ValueRequirement, ValueSpecification};

/// Everything shared by the threads working on one build.
pub(crate) struct BuilderState {
    pub config: BuilderConfig,
    pub compilation_context: Arc<CompilationContext>,
    pub market_data: Arc<dyn MarketDataAvailabilityProvider>,
    pub functions: Arc<dyn FunctionResolver>,

    pub run_queue: Box<dyn RunQueue>,
    /// Work that could not make progress, retried once other work succeeds.
    pub deferred: Mutex<VecDeque<Runnable>>,

    pub requirements: Cache<ValueRequirement, RequirementEntry>,
    pub specifications: Cache<ValueSpecification, Option<SpecificationEntry>>,
    pub terminal: Arc<GetTerminalValuesCallback>,
    pub pending: PendingRequirements,
    exceptions: Mutex<BTreeMap<String, usize>>,

    pub scheduled_steps: AtomicU64,
    pub completed_steps: AtomicU64,
    pub last_cleanup: AtomicU64,
    /// Background jobs, bounded by `max_jobs`.
    pub jobs: AtomicUsize,
    /// Every job running, the callers joining the build included.
    pub running: AtomicUsize,
    pub max_jobs: AtomicUsize,
    pub cancelled: AtomicBool,

    /// Held while targets are added and while the idle check runs, so nobody
    /// sees a finished build halfway through either.
    pub build_lock: Mutex<()>,
    pub build_signal: Condvar,
    pub pool: rayon::ThreadPool,
    pub cleanup: Box<dyn CacheCleanupPolicy>,
}

impl BuilderState {
    pub(crate) fn new(
        config: BuilderConfig,
        compilation_context: CompilationContext,
        market_data: Arc<dyn MarketDataAvailabilityProvider>,
        functions: Arc<dyn FunctionResolver>,
        cleanup: Box<dyn CacheCleanupPolicy>,
    ) -> Result<Self, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_additional_threads.max(1))
            .thread_name(|index| format!("depgraph-{index}"))
            .build()?;
        debug!(threads = pool.current_num_threads(), "builder pool ready");

        Ok(Self {
            run_queue: config.run_queue.create(),
            max_jobs: AtomicUsize::new(config.max_additional_threads),
            config,
            compilation_context: Arc::new(compilation_context),
            market_data,
            functions,
            deferred: Mutex::new(VecDeque::new()),
            requirements: Cache::default(),
            specifications: Cache::default(),
            terminal: Arc::new(GetTerminalValuesCallback::new()),
            pending: PendingRequirements::default(),
            exceptions: Mutex::new(BTreeMap::new()),
            scheduled_steps: AtomicU64::new(0),
            completed_steps: AtomicU64::new(0),
            last_cleanup: AtomicU64::new(0),
            jobs: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            build_lock: Mutex::new(()),
            build_signal: Condvar::new(),
            pool,
            cleanup,
        })
    }

    /// Counts an error by its text, causes included.
    pub(crate) fn record_exception(&self, error: &ResolutionError) {
        let key = match error {
            ResolutionError::Collaborator { source, .. } | ResolutionError::Catalog { source, .. } => {
                let mut key = error.to_string();
                for cause in source.chain().skip(1) {
                    key.push_str(": ");
                    key.push_str(&cause.to_string());
                }
                key
            }
            ResolutionError::Unsatisfiable { .. } => error.to_string(),
        };
        *self.exceptions.lock().unwrap().entry(key).or_default() += 1;
    }

    pub(crate) fn exceptions(&self) -> BTreeMap<String, usize> {
        self.exceptions.lock().unwrap().clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.lock().unwrap().is_empty()
    }

    /// No job running and nothing left to run.
    pub(crate) fn is_idle(&self) -> bool {
        self.running.load(Ordering::Acquire) == 0 && self.run_queue.is_empty() && !self.has_deferred()
    }

    /// Drops cache entries nothing but the cache refers to: registered
    /// producers nobody subscribes to and finished tasks. Returns how many
    /// entries went.
    pub(crate) fn flush_caches(&self, ctx: &mut GraphBuildingContext) -> usize {
        let mut evicted = self.specifications.flush(|slot| {
            let unused = slot
                .as_ref()
                .is_some_and(|entry| entry.producer.core().ref_count() == 1);
            if unused {
                slot.take().map(|entry| vec![entry.producer]).unwrap_or_default()
            } else {
                Vec::new()
            }
        });
        evicted.extend(self.requirements.flush(|tasks| {
            let finished: Vec<_> = tasks
                .iter()
                .filter(|(_, task)| task.is_finished() && task.core().ref_count() == 1)
                .map(|(key, _)| key.clone())
                .collect();
            finished
                .iter()
                .filter_map(|key| tasks.remove(key))
                .map(|task| task as ProducerRef)
                .collect()
        }));

        let count = evicted.len();
        for producer in evicted {
            if producer.release(ctx) != 0 {
                warn!(producer = producer.core().id(), "evicted producer still referenced");
            }
        }

        count
    }

    /// Drops unplaced productions no cached producer can hand out any more,
    /// along with whatever only they consumed. Only called once the build is
    /// idle, while steps still running may hold values not yet pushed.
    pub(crate) fn evict_unplaced_productions(&self) -> usize {
        let mut live = Vec::new();
        self.specifications.for_each(|spec, slot| {
            live.push(spec.clone());
            if let Some(entry) = slot {
                live.extend(entry.producer.core().result_specifications());
            }
        });
        self.requirements.for_each(|_, tasks| {
            for task in tasks.values() {
                live.extend(task.core().result_specifications());
            }
        });
        self.terminal.evict_unplaced(live)
    }
}
