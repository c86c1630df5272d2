use std::sync::Arc;

use serde::Serialize;

use crate::builder::DependencyGraphBuilder;
use crate::builder::cleanup::{CacheCleanupPolicy, EntryCountPolicy};
use crate::builder::state::BuilderState;
use crate::engine::run_queue::RunQueueKind;
use crate::error::{BuildError, ConfigError};
use crate::failure::ResolutionFailureListener;
use crate::function::{
    CompilationContext, FunctionExclusionGroups, FunctionResolver, GraphBuildingBlacklist,
    MarketDataAvailabilityProvider, TargetResolver,
};

/// Tuning knobs of a build.
#[derive(Debug, Clone, Serialize)]
pub struct BuilderConfig {
    /// Background threads on top of any caller joining the build.
    pub max_additional_threads: usize,
    pub run_queue: RunQueueKind,
    /// Skip building failure trees. Unsatisfied requirements are still
    /// reported, just without the reason.
    pub disable_failure_reporting: bool,
    pub disable_cache_cleanup: bool,
    /// Completed steps between two looks at the cleanup policy.
    pub cleanup_interval: u64,
    /// Nested callback deliveries allowed before the rest go through the run
    /// queue.
    pub max_callback_depth: usize,
    pub calculation_configuration: String,
    /// Log every finished graph as JSON at debug level.
    pub dump_dependency_graph: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_additional_threads: default_threads(),
            run_queue: RunQueueKind::default(),
            disable_failure_reporting: false,
            disable_cache_cleanup: false,
            cleanup_interval: 1000,
            max_callback_depth: 16,
            calculation_configuration: "Default".into(),
            dump_dependency_graph: false,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

impl BuilderConfig {
    /// Defaults overridden by the `DEPGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("DEPGRAPH_MAX_ADDITIONAL_THREADS") {
            config.max_additional_threads = match value.trim().parse::<i64>() {
                Ok(-1) => default_threads(),
                Ok(threads) if threads >= 0 => threads as usize,
                _ => return Err(ConfigError::InvalidValue("DEPGRAPH_MAX_ADDITIONAL_THREADS", value)),
            };
        }
        if flag(&lookup, "DEPGRAPH_NO_BACKGROUND_THREADS")? {
            config.max_additional_threads = 0;
        }
        if let Some(value) = lookup("DEPGRAPH_RUN_QUEUE") {
            config.run_queue = value.trim().parse()?;
        }
        config.disable_failure_reporting = flag(&lookup, "DEPGRAPH_DISABLE_FAILURE_REPORTING")?;
        config.disable_cache_cleanup = flag(&lookup, "DEPGRAPH_DISABLE_CACHE_CLEANUP")?;
        Ok(config)
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(name, value)),
    }
}

/// Collects the collaborators and configuration of a [`DependencyGraphBuilder`].
#[derive(Default)]
pub struct BuilderSetup {
    config: BuilderConfig,
    market_data: Option<Arc<dyn MarketDataAvailabilityProvider>>,
    functions: Option<Arc<dyn FunctionResolver>>,
    target_resolver: Option<Arc<dyn TargetResolver>>,
    blacklist: Option<Arc<dyn GraphBuildingBlacklist>>,
    exclusion_groups: Option<Arc<dyn FunctionExclusionGroups>>,
    cleanup: Option<Box<dyn CacheCleanupPolicy>>,
    listener: Option<Arc<dyn ResolutionFailureListener>>,
}

impl BuilderSetup {
    pub fn config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn market_data(mut self, provider: Arc<dyn MarketDataAvailabilityProvider>) -> Self {
        self.market_data = Some(provider);
        self
    }

    pub fn functions(mut self, resolver: Arc<dyn FunctionResolver>) -> Self {
        self.functions = Some(resolver);
        self
    }

    pub fn target_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.target_resolver = Some(resolver);
        self
    }

    pub fn blacklist(mut self, blacklist: Arc<dyn GraphBuildingBlacklist>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    pub fn exclusion_groups(mut self, groups: Arc<dyn FunctionExclusionGroups>) -> Self {
        self.exclusion_groups = Some(groups);
        self
    }

    pub fn cleanup_policy(mut self, policy: impl CacheCleanupPolicy + 'static) -> Self {
        self.cleanup = Some(Box::new(policy));
        self
    }

    pub fn failure_listener(mut self, listener: Arc<dyn ResolutionFailureListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn max_additional_threads(mut self, threads: usize) -> Self {
        self.config.max_additional_threads = threads;
        self
    }

    pub fn run_queue(mut self, kind: RunQueueKind) -> Self {
        self.config.run_queue = kind;
        self
    }

    pub fn disable_failure_reporting(mut self, disable: bool) -> Self {
        self.config.disable_failure_reporting = disable;
        self
    }

    pub fn calculation_configuration(mut self, name: &str) -> Self {
        self.config.calculation_configuration = name.to_string();
        self
    }

    /// Checks that the required collaborators are present and creates the
    /// builder.
    pub fn finish(self) -> Result<DependencyGraphBuilder, BuildError> {
        let market_data = self
            .market_data
            .ok_or(BuildError::MissingCollaborator("market data availability provider"))?;
        let functions = self
            .functions
            .ok_or(BuildError::MissingCollaborator("function resolver"))?;

        let mut compilation_context = CompilationContext::new(&self.config.calculation_configuration);
        if let Some(resolver) = self.target_resolver {
            compilation_context.target_resolver = resolver;
        }
        if let Some(blacklist) = self.blacklist {
            compilation_context.blacklist = blacklist;
        }
        compilation_context.exclusion_groups = self.exclusion_groups;

        let cleanup = self
            .cleanup
            .unwrap_or_else(|| Box::new(EntryCountPolicy::default()));
        let state = BuilderState::new(self.config, compilation_context, market_data, functions, cleanup)?;
        if let Some(listener) = self.listener {
            state.terminal.set_failure_listener(listener);
        }
        Ok(DependencyGraphBuilder::from_state(state))
    }
}
