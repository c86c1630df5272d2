//! Structured record of why a requirement could not be resolved.
//!
//! Failures are trees: a requirement carries the list of things tried for it,
//! and a failed function application carries the failures of its unsatisfied
//! inputs. The engine only builds them when failure reporting is enabled.
mod printer;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::Serialize;

use crate::function::NodeFunction;
use crate::value::{ValueRequirement, ValueSpecification};

pub use printer::FailurePrinter;

/// Failure taxonomy, independent of how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FailureKind {
    RecursiveRequirement,
    CouldNotResolve,
    NoFunctions,
    MarketDataMissing,
    GetRequirementsFailed,
    GetResultsFailed,
    GetAdditionalRequirementsFailed,
    LateResolutionFailure,
    Suppressed,
    Unsatisfied,
}

/// How a function application ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ApplicationOutcome {
    GetRequirementsFailed,
    GetResultsFailed,
    GetAdditionalRequirementsFailed,
    LateResolutionFailure,
    Suppressed,
    /// One or more inputs could not be resolved.
    Unsatisfied,
}

impl From<ApplicationOutcome> for FailureKind {
    fn from(value: ApplicationOutcome) -> Self {
        match value {
            ApplicationOutcome::GetRequirementsFailed => FailureKind::GetRequirementsFailed,
            ApplicationOutcome::GetResultsFailed => FailureKind::GetResultsFailed,
            ApplicationOutcome::GetAdditionalRequirementsFailed => {
                FailureKind::GetAdditionalRequirementsFailed
            }
            ApplicationOutcome::LateResolutionFailure => FailureKind::LateResolutionFailure,
            ApplicationOutcome::Suppressed => FailureKind::Suppressed,
            ApplicationOutcome::Unsatisfied => FailureKind::Unsatisfied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SatisfiedInput {
    pub requirement: ValueRequirement,
    pub specification: ValueSpecification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionApplicationFailure {
    pub function: NodeFunction,
    pub output: ValueSpecification,
    pub satisfied: Vec<SatisfiedInput>,
    pub unsatisfied: Vec<ResolutionFailure>,
    pub additional_unsatisfied: Vec<ResolutionFailure>,
    pub outcome: ApplicationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FailureEvent {
    RecursiveRequirement,
    CouldNotResolve,
    NoFunctions,
    MarketDataMissing,
    FunctionApplication(FunctionApplicationFailure),
}

impl FailureEvent {
    pub fn kind(&self) -> FailureKind {
        match self {
            FailureEvent::RecursiveRequirement => FailureKind::RecursiveRequirement,
            FailureEvent::CouldNotResolve => FailureKind::CouldNotResolve,
            FailureEvent::NoFunctions => FailureKind::NoFunctions,
            FailureEvent::MarketDataMissing => FailureKind::MarketDataMissing,
            FailureEvent::FunctionApplication(application) => application.outcome.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionFailure {
    requirement: ValueRequirement,
    events: Vec<FailureEvent>,
}

impl ResolutionFailure {
    pub(crate) fn new(requirement: ValueRequirement, event: FailureEvent) -> Self {
        Self {
            requirement,
            events: vec![event],
        }
    }

    pub fn requirement(&self) -> &ValueRequirement {
        &self.requirement
    }

    pub fn events(&self) -> &[FailureEvent] {
        &self.events
    }

    /// Kinds of the events recorded directly against this requirement.
    pub fn kinds(&self) -> BTreeSet<FailureKind> {
        self.events.iter().map(FailureEvent::kind).collect()
    }

    /// Whether `kind` occurs anywhere in the tree.
    pub fn contains_kind(&self, kind: FailureKind) -> bool {
        self.events.iter().any(|event| {
            event.kind() == kind
                || match event {
                    FailureEvent::FunctionApplication(application) => application
                        .unsatisfied
                        .iter()
                        .chain(&application.additional_unsatisfied)
                        .any(|nested| nested.contains_kind(kind)),
                    _ => false,
                }
        })
    }

    /// Folds the events of `other` into this failure, skipping duplicates.
    pub fn merge(&mut self, other: &ResolutionFailure) {
        for event in &other.events {
            if !self.events.contains(event) {
                self.events.push(event.clone());
            }
        }
    }

    /// Calls the visitor once per event, in recording order.
    pub fn accept<V: ResolutionFailureVisitor>(&self, visitor: &mut V) -> Vec<V::Output> {
        self.events
            .iter()
            .map(|event| match event {
                FailureEvent::RecursiveRequirement => {
                    visitor.visit_recursive_requirement(&self.requirement)
                }
                FailureEvent::CouldNotResolve => visitor.visit_could_not_resolve(&self.requirement),
                FailureEvent::NoFunctions => visitor.visit_no_functions(&self.requirement),
                FailureEvent::MarketDataMissing => {
                    visitor.visit_market_data_missing(&self.requirement)
                }
                FailureEvent::FunctionApplication(application) => {
                    visitor.visit_function_application(&self.requirement, application)
                }
            })
            .collect()
    }
}

/// Accumulates failures for one producer.
pub(crate) fn merge_into(slot: &mut Option<ResolutionFailure>, failure: Option<&ResolutionFailure>) {
    let Some(failure) = failure else { return };
    match slot {
        Some(existing) => existing.merge(failure),
        None => *slot = Some(failure.clone()),
    }
}

/// Builder for function application failures, handed out by the building
/// context only when failure reporting is enabled.
#[derive(Debug, Clone)]
pub(crate) struct FunctionApplication {
    requirement: ValueRequirement,
    function: NodeFunction,
    output: ValueSpecification,
    satisfied: Vec<SatisfiedInput>,
    unsatisfied: Vec<ResolutionFailure>,
    additional_unsatisfied: Vec<ResolutionFailure>,
}

impl FunctionApplication {
    pub(crate) fn new(
        requirement: ValueRequirement,
        function: NodeFunction,
        output: ValueSpecification,
    ) -> Self {
        Self {
            requirement,
            function,
            output,
            satisfied: Vec::new(),
            unsatisfied: Vec::new(),
            additional_unsatisfied: Vec::new(),
        }
    }

    pub(crate) fn with_inputs(mut self, inputs: &BTreeMap<ValueSpecification, ValueRequirement>) -> Self {
        self.satisfied = inputs
            .iter()
            .map(|(specification, requirement)| SatisfiedInput {
                requirement: requirement.clone(),
                specification: specification.clone(),
            })
            .collect();
        self
    }

    pub(crate) fn with_unsatisfied(
        mut self,
        requirement: &ValueRequirement,
        failure: Option<&ResolutionFailure>,
    ) -> Self {
        self.unsatisfied.push(nested(requirement, failure));
        self
    }

    pub(crate) fn with_additional_unsatisfied(
        mut self,
        requirement: &ValueRequirement,
        failure: Option<&ResolutionFailure>,
    ) -> Self {
        self.additional_unsatisfied.push(nested(requirement, failure));
        self
    }

    pub(crate) fn finish(self, outcome: ApplicationOutcome) -> ResolutionFailure {
        ResolutionFailure::new(
            self.requirement,
            FailureEvent::FunctionApplication(FunctionApplicationFailure {
                function: self.function,
                output: self.output,
                satisfied: self.satisfied,
                unsatisfied: self.unsatisfied,
                additional_unsatisfied: self.additional_unsatisfied,
                outcome,
            }),
        )
    }
}

fn nested(requirement: &ValueRequirement, failure: Option<&ResolutionFailure>) -> ResolutionFailure {
    match failure {
        Some(failure) => failure.clone(),
        None => ResolutionFailure {
            requirement: requirement.clone(),
            events: Vec::new(),
        },
    }
}

pub trait ResolutionFailureVisitor {
    type Output;

    fn visit_recursive_requirement(&mut self, requirement: &ValueRequirement) -> Self::Output;
    fn visit_could_not_resolve(&mut self, requirement: &ValueRequirement) -> Self::Output;
    fn visit_no_functions(&mut self, requirement: &ValueRequirement) -> Self::Output;
    fn visit_market_data_missing(&mut self, requirement: &ValueRequirement) -> Self::Output;
    fn visit_function_application(
        &mut self,
        requirement: &ValueRequirement,
        application: &FunctionApplicationFailure,
    ) -> Self::Output;
}

/// Receives the failure tree of each top-level requirement that could not be
/// satisfied.
pub trait ResolutionFailureListener: Send + Sync {
    fn notify_failure(&self, failure: &ResolutionFailure);
}

/// Listener keeping every failure it is told about.
#[derive(Debug, Default)]
pub struct ResolutionFailureGatherer {
    failures: Mutex<Vec<ResolutionFailure>>,
}

impl ResolutionFailureGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<ResolutionFailure> {
        self.failures.lock().unwrap().clone()
    }
}

impl ResolutionFailureListener for ResolutionFailureGatherer {
    fn notify_failure(&self, failure: &ResolutionFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }
}
