//! Contracts for the collaborators the engine drives, plus small in-memory
//! implementations of each.
mod market_data;
mod repository;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;

use crate::core::ArcStr;
use crate::value::{TargetReference, TargetSpecification, ValueRequirement, ValueSpecification};

pub use market_data::{
    FixedMarketDataProvider, MarketDataAvailabilityProvider, MarketDataSourcingFunction,
    NoMarketData,
};

pub(crate) use market_data::market_data_value;
pub use repository::FunctionRepository;

/// An opaque function the engine can wire into the graph.
///
/// All three resolution calls may run many times, for different candidate
/// resolutions and from different threads. Returning `Ok(None)` means the
/// function cannot proceed with what it was given, which the engine records as
/// a failure of that candidate. Returning `Err` is treated the same way and the
/// error is also kept for top-level reporting.
pub trait FunctionDefinition: Send + Sync {
    /// Unique identifier, used for node merging and in diagnostics.
    fn id(&self) -> &str;

    /// Outputs the function could produce on `target`, before any input is
    /// known. Used by catalogs to enumerate candidates.
    fn nominal_results(&self, target: &TargetSpecification) -> Option<BTreeSet<ValueSpecification>>;

    /// Inputs needed to produce `desired` on `target`.
    fn get_requirements(
        &self,
        context: &CompilationContext,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>>;

    /// Actual outputs once the concrete inputs are known.
    ///
    /// The default keeps the provisional outputs unchanged.
    fn get_results(
        &self,
        _context: &CompilationContext,
        _target: &TargetSpecification,
        _inputs: &BTreeMap<ValueSpecification, ValueRequirement>,
        provisional: &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<Option<BTreeSet<ValueSpecification>>> {
        Ok(Some(provisional.clone()))
    }

    /// Further inputs implied by the chosen inputs and outputs.
    fn get_additional_requirements(
        &self,
        _context: &CompilationContext,
        _target: &TargetSpecification,
        _inputs: &BTreeSet<ValueSpecification>,
        _outputs: &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>> {
        Ok(Some(BTreeSet::new()))
    }

    /// Whether the function can still run when some inputs fail to resolve.
    fn can_handle_missing_requirements(&self) -> bool {
        false
    }
}

/// Function parameters, opaque to the engine apart from equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionParameters(Arc<BTreeMap<ArcStr, ArcStr>>);

impl FunctionParameters {
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(Arc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (ArcStr::from(k), ArcStr::from(v)))
                .collect(),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A function definition bound to its parameters.
#[derive(Clone)]
pub struct ParameterizedFunction {
    id: ArcStr,
    function: Arc<dyn FunctionDefinition>,
    parameters: FunctionParameters,
}

impl ParameterizedFunction {
    pub fn new(function: Arc<dyn FunctionDefinition>, parameters: FunctionParameters) -> Self {
        Self {
            id: function.id().into(),
            function,
            parameters,
        }
    }

    pub fn of(function: Arc<dyn FunctionDefinition>) -> Self {
        Self::new(function, FunctionParameters::default())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &Arc<dyn FunctionDefinition> {
        &self.function
    }

    pub fn parameters(&self) -> &FunctionParameters {
        &self.parameters
    }

    /// The identity used for graph nodes, without the live definition.
    pub fn node_function(&self) -> NodeFunction {
        NodeFunction {
            function_id: self.id.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl PartialEq for ParameterizedFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.parameters == other.parameters
    }
}

impl Eq for ParameterizedFunction {}

impl Hash for ParameterizedFunction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.parameters.hash(state);
    }
}

impl Debug for ParameterizedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterizedFunction")
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl Serialize for ParameterizedFunction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node_function().serialize(serializer)
    }
}

impl Display for ParameterizedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Function identity as stored on a dependency node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeFunction {
    pub function_id: ArcStr,
    pub parameters: FunctionParameters,
}

impl Display for NodeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.function_id)
    }
}

/// One entry of the lazily enumerated candidate sequence.
#[derive(Debug, Clone)]
pub struct FunctionCandidate {
    pub function: ParameterizedFunction,
    /// The output matching the requested name, before constraints are applied.
    pub output: ValueSpecification,
    /// Everything the application would produce, `output` included.
    pub outputs: BTreeSet<ValueSpecification>,
}

pub type CandidateIter = Box<dyn Iterator<Item = FunctionCandidate> + Send>;

/// The function catalog. Candidates must be produced lazily, best first.
pub trait FunctionResolver: Send + Sync {
    fn resolve_function(
        &self,
        value_name: &str,
        target: &TargetSpecification,
        constraints: &crate::value::ValueProperties,
    ) -> anyhow::Result<CandidateIter>;
}

pub trait TargetResolver: Send + Sync {
    /// Deterministic for a fixed version of the underlying data.
    fn resolve(&self, reference: &TargetReference) -> Option<TargetSpecification>;
}

/// Resolves concrete references as-is and external identifiers from a table.
#[derive(Debug, Default)]
pub struct DirectTargetResolver {
    external: HashMap<(ArcStr, ArcStr), TargetSpecification>,
}

impl DirectTargetResolver {
    pub fn with_external(mut self, kind: &str, identifier: &str, target: TargetSpecification) -> Self {
        self.external.insert((kind.into(), identifier.into()), target);
        self
    }
}

impl TargetResolver for DirectTargetResolver {
    fn resolve(&self, reference: &TargetReference) -> Option<TargetSpecification> {
        match reference {
            TargetReference::Specification(spec) => Some(spec.clone()),
            TargetReference::External { kind, identifier } => {
                self.external.get(&(kind.clone(), identifier.clone())).cloned()
            }
        }
    }
}

/// Suppression policy consulted right before a resolution is emitted.
pub trait GraphBuildingBlacklist: Send + Sync {
    fn is_blacklisted(
        &self,
        function: &ParameterizedFunction,
        target: &TargetSpecification,
        inputs: &BTreeSet<ValueSpecification>,
        outputs: &BTreeSet<ValueSpecification>,
    ) -> bool;
}

#[derive(Debug, Default)]
pub struct EmptyBlacklist;

impl GraphBuildingBlacklist for EmptyBlacklist {
    fn is_blacklisted(
        &self,
        _: &ParameterizedFunction,
        _: &TargetSpecification,
        _: &BTreeSet<ValueSpecification>,
        _: &BTreeSet<ValueSpecification>,
    ) -> bool {
        false
    }
}

/// Suppresses every application of the listed function ids.
#[derive(Debug, Default)]
pub struct FunctionBlacklist(HashSet<ArcStr>);

impl FunctionBlacklist {
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self(ids.into_iter().map(ArcStr::from).collect())
    }
}

impl GraphBuildingBlacklist for FunctionBlacklist {
    fn is_blacklisted(
        &self,
        function: &ParameterizedFunction,
        _: &TargetSpecification,
        _: &BTreeSet<ValueSpecification>,
        _: &BTreeSet<ValueSpecification>,
    ) -> bool {
        self.0.contains(function.id())
    }
}

/// Functions sharing a group are never stacked on top of each other for the
/// same value name on the same target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionExclusionGroup(ArcStr);

impl FunctionExclusionGroup {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }
}

pub trait FunctionExclusionGroups: Send + Sync {
    fn exclusion_group(&self, function: &ParameterizedFunction) -> Option<FunctionExclusionGroup>;
}

/// Exclusion groups assigned per function id.
#[derive(Debug, Default)]
pub struct ExclusionGroupTable(HashMap<ArcStr, FunctionExclusionGroup>);

impl ExclusionGroupTable {
    pub fn with(mut self, function_id: &str, group: &str) -> Self {
        self.0
            .insert(function_id.into(), FunctionExclusionGroup::new(group));
        self
    }
}

impl FunctionExclusionGroups for ExclusionGroupTable {
    fn exclusion_group(&self, function: &ParameterizedFunction) -> Option<FunctionExclusionGroup> {
        self.0.get(function.id()).cloned()
    }
}

/// Everything a function may consult while the graph is being compiled.
#[derive(Clone)]
pub struct CompilationContext {
    pub calculation_configuration: ArcStr,
    pub target_resolver: Arc<dyn TargetResolver>,
    pub blacklist: Arc<dyn GraphBuildingBlacklist>,
    pub exclusion_groups: Option<Arc<dyn FunctionExclusionGroups>>,
}

impl CompilationContext {
    pub fn new(calculation_configuration: &str) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            target_resolver: Arc::new(DirectTargetResolver::default()),
            blacklist: Arc::new(EmptyBlacklist),
            exclusion_groups: None,
        }
    }
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self::new("Default")
    }
}

impl Debug for CompilationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationContext")
            .field("calculation_configuration", &self.calculation_configuration)
            .finish_non_exhaustive()
    }
}
