#![forbid(unsafe_code)]
//! Concurrent dependency graph construction.
//!
//! Given top-level value requirements, a catalog of functions and a market
//! data availability provider, [`DependencyGraphBuilder`] works out which
//! function applications on which targets produce every requirement, and
//! wires them into a [`DependencyGraph`]. Resolution runs on a pool of
//! background threads, with the caller joining in when it asks for the graph.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use depgraph::function::{FunctionRepository, NoMarketData};
//! use depgraph::value::{TargetSpecification, ValueRequirement};
//! use depgraph::DependencyGraphBuilder;
//!
//! let builder = DependencyGraphBuilder::setup()
//!     .market_data(Arc::new(NoMarketData))
//!     .functions(FunctionRepository::new().into_resolver())
//!     .finish()?;
//!
//! builder.add_target(ValueRequirement::of("PV", TargetSpecification::primitive("Swap")));
//! let graph = builder.get_dependency_graph()?;
//! println!("{graph}");
//! # Ok::<(), depgraph::BuildError>(())
//! ```

mod builder;
mod core;
mod engine;
mod error;
pub mod failure;
pub mod function;
mod graph;
mod utils;
pub mod value;

pub use crate::builder::{
    BuilderConfig, BuilderSetup, CacheCleanupPolicy, CacheStats, DependencyGraphBuilder,
    EntryCountPolicy, NoCleanup,
};
pub use crate::engine::run_queue::RunQueueKind;
pub use crate::error::*;
pub use crate::graph::{DependencyGraph, DependencyNode};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
