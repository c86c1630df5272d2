use std::sync::Arc;

use thiserror::Error;

use crate::failure::ResolutionFailure;
use crate::value::ValueRequirement;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Graph build was cancelled")]
    Cancelled,

    #[error("Builder is missing a collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Invalid builder configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Couldn't start worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Problems met while resolving one requirement. These never abort a build,
/// they are collected and reported alongside the graph.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Unsatisfied requirement {requirement}")]
    Unsatisfiable {
        requirement: ValueRequirement,
        failure: Option<Arc<ResolutionFailure>>,
    },

    #[error("Function '{function}' failed in {call}:\n{source}")]
    Collaborator {
        call: &'static str,
        function: String,
        source: anyhow::Error,
    },

    #[error("Function catalog failed for {requirement}:\n{source}")]
    Catalog {
        requirement: ValueRequirement,
        source: anyhow::Error,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityError {
    #[error("Market data is known to be unavailable")]
    NotSatisfiable,

    #[error("Market data availability check would block")]
    WouldBlock,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Variable '{0}' has invalid value '{1}'")]
    InvalidValue(&'static str, String),
}
