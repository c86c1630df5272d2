use std::collections::BTreeSet;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::*;
use crate::engine::run_queue::RunQueueKind;
use crate::error::AvailabilityError;
use crate::failure::{FailureKind, ResolutionFailureGatherer};
use crate::function::{
    CompilationContext, ExclusionGroupTable, FixedMarketDataProvider, FunctionBlacklist, FunctionDefinition,
    FunctionRepository, MarketDataAvailabilityProvider, MarketDataSourcingFunction, NoMarketData,
    ParameterizedFunction,
};
use crate::value::{ResolvedValue, TargetSpecification, ValueProperties};

/// Produces fixed outputs on any target from inputs of the same target.
struct MockFunction {
    id: &'static str,
    outputs: Vec<(&'static str, ValueProperties)>,
    inputs: Vec<(&'static str, ValueProperties)>,
    error: Option<&'static str>,
    declines: bool,
    handles_missing: bool,
    /// Properties the outputs actually carry once the inputs are known.
    actual: Option<ValueProperties>,
}

impl MockFunction {
    fn new(id: &'static str, outputs: &[&'static str]) -> Self {
        Self {
            id,
            outputs: outputs
                .iter()
                .map(|name| (*name, ValueProperties::none()))
                .collect(),
            inputs: Vec::new(),
            error: None,
            declines: false,
            handles_missing: false,
            actual: None,
        }
    }

    fn with_properties(id: &'static str, output: &'static str, properties: ValueProperties) -> Self {
        Self {
            outputs: vec![(output, properties)],
            ..Self::new(id, &[])
        }
    }

    fn needs(mut self, inputs: &[&'static str]) -> Self {
        self.inputs = inputs
            .iter()
            .map(|name| (*name, ValueProperties::none()))
            .collect();
        self
    }

    fn needs_with(mut self, input: &'static str, constraints: ValueProperties) -> Self {
        self.inputs.push((input, constraints));
        self
    }

    fn failing(mut self, message: &'static str) -> Self {
        self.error = Some(message);
        self
    }

    fn declining(mut self) -> Self {
        self.declines = true;
        self
    }

    fn handling_missing(mut self) -> Self {
        self.handles_missing = true;
        self
    }

    fn producing(mut self, actual: ValueProperties) -> Self {
        self.actual = Some(actual);
        self
    }

    fn shared(self) -> Arc<dyn FunctionDefinition> {
        Arc::new(self)
    }
}

impl FunctionDefinition for MockFunction {
    fn id(&self) -> &str {
        self.id
    }

    fn nominal_results(&self, target: &TargetSpecification) -> Option<BTreeSet<ValueSpecification>> {
        Some(
            self.outputs
                .iter()
                .map(|(name, properties)| ValueSpecification::new(name, target.clone(), properties.clone()))
                .collect(),
        )
    }

    fn get_requirements(
        &self,
        _: &CompilationContext,
        target: &TargetSpecification,
        _: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>> {
        if let Some(message) = self.error {
            anyhow::bail!(message);
        }
        if self.declines {
            return Ok(None);
        }
        Ok(Some(
            self.inputs
                .iter()
                .map(|(name, constraints)| ValueRequirement::new(name, target.clone(), constraints.clone()))
                .collect(),
        ))
    }

    fn get_results(
        &self,
        _: &CompilationContext,
        target: &TargetSpecification,
        _: &BTreeMap<ValueSpecification, ValueRequirement>,
        provisional: &BTreeSet<ValueSpecification>,
    ) -> anyhow::Result<Option<BTreeSet<ValueSpecification>>> {
        let Some(actual) = &self.actual else {
            return Ok(Some(provisional.clone()));
        };
        Ok(Some(
            provisional
                .iter()
                .map(|output| ValueSpecification::new(output.name(), target.clone(), actual.clone()))
                .collect(),
        ))
    }

    fn can_handle_missing_requirements(&self) -> bool {
        self.handles_missing
    }
}

/// Answers `WouldBlock` until `ready_after` has passed since the first
/// question, then offers `available`.
struct SlowMarketData {
    available: ValueSpecification,
    ready_after: Duration,
    first_call: Mutex<Option<Instant>>,
    calls: Arc<AtomicUsize>,
}

impl MarketDataAvailabilityProvider for SlowMarketData {
    fn get_availability(
        &self,
        _: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, AvailabilityError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let first = *self.first_call.lock().unwrap().get_or_insert_with(Instant::now);
        if first.elapsed() < self.ready_after {
            return Err(AvailabilityError::WouldBlock);
        }
        Ok(desired.is_satisfied_by(&self.available).then(|| self.available.clone()))
    }
}

fn target() -> TargetSpecification {
    TargetSpecification::primitive("T")
}

fn requirement(name: &str) -> ValueRequirement {
    ValueRequirement::of(name, target())
}

fn spec(name: &str) -> ValueSpecification {
    ValueSpecification::new(name, target(), ValueProperties::none())
}

fn setup(functions: FunctionRepository) -> BuilderSetup {
    setup_with(functions, NoMarketData)
}

fn setup_with(functions: FunctionRepository, market_data: impl MarketDataAvailabilityProvider + 'static) -> BuilderSetup {
    DependencyGraphBuilder::setup()
        .market_data(Arc::new(market_data))
        .functions(functions.into_resolver())
        .max_additional_threads(0)
}

fn builder(functions: FunctionRepository) -> DependencyGraphBuilder {
    setup(functions).finish().unwrap()
}

fn function_ids(graph: &DependencyGraph) -> BTreeSet<String> {
    graph.nodes().map(|node| node.function.id().to_string()).collect()
}

#[test]
fn test_single_function() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A"]).shared()));
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 1);
    assert_eq!(function_ids(&graph), BTreeSet::from(["F".to_string()]));
    assert_eq!(
        graph.terminal_outputs().get(&spec("A")),
        Some(&BTreeSet::from([requirement("A")]))
    );
    assert!(builder.outstanding_requirements().is_empty());
    assert!(builder.unsatisfied().is_empty());
    assert!(graph.is_acyclic());
}

#[test]
fn test_two_outputs_share_a_node() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A", "B"]).shared()));
    builder.add_targets([requirement("A"), requirement("B")]);
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 1);
    let node = graph.nodes().next().unwrap();
    assert_eq!(node.outputs, BTreeSet::from([spec("A"), spec("B")]));
    assert_eq!(graph.terminal_outputs().len(), 2);
}

#[test]
fn test_unsatisfiable_requirement() {
    let gatherer = Arc::new(ResolutionFailureGatherer::new());
    let builder = setup(FunctionRepository::new())
        .failure_listener(gatherer.clone())
        .finish()
        .unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 0);
    assert!(graph.terminal_outputs().is_empty());
    assert!(builder.outstanding_requirements().is_empty());

    let unsatisfied = builder.unsatisfied();
    assert_eq!(unsatisfied.len(), 1);
    assert!(matches!(
        &unsatisfied[0],
        ResolutionError::Unsatisfiable { requirement: r, .. } if *r == requirement("A")
    ));

    let failures = gatherer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].requirement(), &requirement("A"));
    assert!(failures[0].contains_kind(FailureKind::NoFunctions));

    let exceptions = builder.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions.keys().all(|key| key.starts_with("Unsatisfied requirement")));
}

#[test]
fn test_two_level_chain() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.graph().edge_count(), 1);
    assert_eq!(graph.root_nodes()[0].function.id(), "F1");
    assert_eq!(graph.leaf_nodes()[0].function.id(), "F2");
    assert_eq!(graph.root_nodes()[0].inputs, BTreeSet::from([spec("B")]));
    // Only the requested value is terminal.
    assert_eq!(graph.terminal_outputs().keys().collect::<Vec<_>>(), [&spec("A")]);
}

#[test]
fn test_market_data_leaf() {
    let functions = FunctionRepository::new().add(MockFunction::new("F1", &["A"]).needs(&["X"]).shared());
    let market_data = FixedMarketDataProvider::new().available(spec("X"));
    let builder = setup_with(functions, market_data).finish().unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 2);
    let leaf = graph.leaf_nodes()[0];
    assert_eq!(leaf.function.id(), MarketDataSourcingFunction::ID);
    assert_eq!(leaf.outputs, BTreeSet::from([spec("X")]));
    assert!(leaf.inputs.is_empty());
}

#[test]
fn test_missing_market_data_fails() {
    let functions = FunctionRepository::new().add(MockFunction::new("F1", &["A"]).needs(&["X"]).shared());
    let market_data = FixedMarketDataProvider::new().missing("X", target());
    let builder = setup_with(functions, market_data).finish().unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 0);
    assert_eq!(builder.unsatisfied().len(), 1);
}

#[test]
fn test_highest_priority_wins() {
    let functions = FunctionRepository::new()
        .add_with_priority(ParameterizedFunction::of(MockFunction::new("low", &["A"]).shared()), 1)
        .add_with_priority(ParameterizedFunction::of(MockFunction::new("high", &["A"]).shared()), 10);
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["high".to_string()]));
}

#[test]
fn test_constraints_pick_matching_function() {
    let currency = |ccy: &str| ValueProperties::builder().with("Currency", ccy).build();
    let functions = FunctionRepository::new()
        .add(MockFunction::with_properties("usd", "PV", currency("USD")).shared())
        .add(MockFunction::with_properties("eur", "PV", currency("EUR")).shared());
    let builder = builder(functions);
    builder.add_target(ValueRequirement::new("PV", target(), currency("EUR")));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["eur".to_string()]));
    let (terminal, _) = graph.terminal_outputs().iter().next().unwrap();
    assert_eq!(terminal.properties(), &currency("EUR"));
}

#[test]
fn test_wildcard_output_narrowed_to_constraint() {
    let functions = FunctionRepository::new().add(
        MockFunction::with_properties("F", "PV", ValueProperties::builder().with_any("Currency").build()).shared(),
    );
    let builder = builder(functions);
    let usd = ValueProperties::builder().with("Currency", "USD").build();
    builder.add_target(ValueRequirement::new("PV", target(), usd.clone()));
    let graph = builder.get_dependency_graph().unwrap();

    let (terminal, _) = graph.terminal_outputs().iter().next().unwrap();
    assert_eq!(terminal.properties(), &usd);
}

#[test]
fn test_backtracks_to_next_function() {
    let functions = FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(MockFunction::new("F1", &["A"]).needs(&["Missing"]).shared()),
            10,
        )
        .add(MockFunction::new("F2", &["A"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["F2".to_string()]));
    assert!(builder.unsatisfied().is_empty());
}

#[test]
fn test_recursion_fails_without_hanging() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B"]).needs(&["A"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 0);
    assert_eq!(builder.unsatisfied().len(), 1);
    assert!(builder.outstanding_requirements().is_empty());
}

#[test]
fn test_recursion_broken_by_alternative() {
    let functions = FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(MockFunction::new("F1", &["A"]).needs(&["B"]).shared()),
            10,
        )
        .add_with_priority(
            ParameterizedFunction::of(MockFunction::new("F2", &["B"]).needs(&["A"]).shared()),
            10,
        )
        .add(MockFunction::new("F3", &["B"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(
        function_ids(&graph),
        BTreeSet::from(["F1".to_string(), "F3".to_string()])
    );
    assert!(graph.is_acyclic());
}

#[test]
fn test_shared_input_is_one_node() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["C"]).shared())
        .add(MockFunction::new("F2", &["B"]).needs(&["C"]).shared())
        .add(MockFunction::new("F3", &["C"]).shared());
    let builder = builder(functions);
    builder.add_targets([requirement("A"), requirement("B")]);
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 3);
    assert_eq!(graph.graph().edge_count(), 2);
    assert_eq!(graph.leaf_nodes().len(), 1);
    assert_eq!(graph.root_nodes().len(), 2);
}

#[test]
fn test_background_threads_build_same_graph() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["C"]).shared())
        .add(MockFunction::new("F2", &["B"]).needs(&["C"]).shared())
        .add(MockFunction::new("F3", &["C"]).needs(&["D"]).shared())
        .add(MockFunction::new("F4", &["D"]).shared());
    let builder = setup(functions).max_additional_threads(4).finish().unwrap();
    builder.add_targets([requirement("A"), requirement("B")]);
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.graph().edge_count(), 3);
    assert!(builder.is_graph_built().unwrap());
}

#[test]
fn test_cancel() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A"]).shared()));
    builder.add_target(requirement("A"));
    builder.cancel();

    assert!(builder.is_cancelled());
    assert!(matches!(builder.get_dependency_graph(), Err(BuildError::Cancelled)));
    assert!(matches!(builder.poll_dependency_graph(), Err(BuildError::Cancelled)));
}

#[test]
fn test_outstanding_and_progress() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A"]).shared()));
    assert_eq!(builder.build_fraction_estimate(), 1.0);

    builder.add_target(requirement("A"));
    // Nothing runs until a caller joins the build.
    assert_eq!(builder.outstanding_requirements(), [requirement("A")]);
    assert_eq!(builder.build_fraction_estimate(), 0.0);
    assert!(builder.poll_dependency_graph().unwrap().is_none());

    builder.get_dependency_graph().unwrap();
    assert!(builder.outstanding_requirements().is_empty());
    assert!(builder.build_fraction_estimate() > 0.5);
    assert!(builder.poll_dependency_graph().unwrap().is_some());
}

#[test]
fn test_exceptions_table() {
    let functions = FunctionRepository::new().add(MockFunction::new("F", &["A"]).failing("boom").shared());
    let builder = builder(functions);
    builder.add_targets([requirement("A"), requirement("A")]);
    builder.get_dependency_graph().unwrap();

    let exceptions = builder.exceptions();
    assert!(
        exceptions.keys().any(|key| key.contains("boom")),
        "{exceptions:?}"
    );
    assert!(exceptions.keys().any(|key| key.starts_with("Unsatisfied requirement")));
}

#[test]
fn test_blacklist_suppresses_application() {
    let functions = FunctionRepository::new()
        .add_with_priority(ParameterizedFunction::of(MockFunction::new("F1", &["A"]).shared()), 10)
        .add(MockFunction::new("F2", &["A"]).shared());
    let builder = setup(functions)
        .blacklist(Arc::new(FunctionBlacklist::new(["F1"])))
        .finish()
        .unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["F2".to_string()]));
}

#[test]
fn test_value_requirement_mapping() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A", "B"]).shared()));
    builder.add_targets([requirement("A"), requirement("B")]);
    builder.get_dependency_graph().unwrap();

    let mapping = builder.value_requirement_mapping();
    assert_eq!(mapping.len(), 2);
    assert_eq!(mapping[&spec("A")], BTreeSet::from([requirement("A")]));
    assert_eq!(mapping[&spec("B")], BTreeSet::from([requirement("B")]));
}

#[test]
fn test_incremental_build_reuses_previous_graph() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B"]).shared());
    let first = builder(functions);
    first.add_target(requirement("A"));
    let previous = first.get_dependency_graph().unwrap();

    // No functions at all, the previous graph alone satisfies the target.
    let second = builder(FunctionRepository::new());
    second.set_dependency_graph(&previous);
    second.add_target(requirement("A"));
    let graph = second.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(function_ids(&graph), function_ids(&previous));
    assert!(second.unsatisfied().is_empty());
}

#[test]
fn test_unused_outputs_pruned() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B", "Extra"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let mut graph = builder.get_dependency_graph().unwrap();

    let leaf = graph.leaf_nodes()[0].clone();
    assert_eq!(leaf.outputs, BTreeSet::from([spec("B"), spec("Extra")]));
    graph.remove_unnecessary_values();
    let leaf = graph.leaf_nodes()[0];
    assert_eq!(leaf.outputs, BTreeSet::from([spec("B")]));
}

fn currency(ccy: &str) -> ValueProperties {
    ValueProperties::builder().with("Currency", ccy).build()
}

fn any_currency() -> ValueProperties {
    ValueProperties::builder().with_any("Currency").build()
}

/// Two conversions in one group and a base value only in GBP.
fn conversions() -> FunctionRepository {
    FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(
                MockFunction::with_properties("F1", "PV", any_currency())
                    .needs_with("PV", currency("USD"))
                    .shared(),
            ),
            10,
        )
        .add_with_priority(
            ParameterizedFunction::of(
                MockFunction::with_properties("F2", "PV", any_currency())
                    .needs_with("PV", currency("GBP"))
                    .shared(),
            ),
            5,
        )
        .add(MockFunction::with_properties("gbp", "PV", currency("GBP")).shared())
}

#[test]
fn test_exclusion_group_prunes_stacked_functions() {
    let ids = |builder: DependencyGraphBuilder| {
        builder.add_target(ValueRequirement::new("PV", target(), currency("EUR")));
        let graph = builder.get_dependency_graph().unwrap();
        assert!(builder.unsatisfied().is_empty());
        function_ids(&graph)
    };

    // F1 converts from USD, which only F2 can supply by converting again.
    let stacked = ids(setup(conversions()).finish().unwrap());
    assert_eq!(
        stacked,
        BTreeSet::from(["F1".to_string(), "F2".to_string(), "gbp".to_string()])
    );

    let groups = ExclusionGroupTable::default().with("F1", "convert").with("F2", "convert");
    let pruned = ids(setup(conversions()).exclusion_groups(Arc::new(groups)).finish().unwrap());
    assert_eq!(pruned, BTreeSet::from(["F2".to_string(), "gbp".to_string()]));
}

#[test]
fn test_function_copes_with_missing_input() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B", "Missing"]).handling_missing().shared())
        .add(MockFunction::new("F2", &["B"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.root_nodes()[0].function.id(), "F1");
    assert_eq!(graph.root_nodes()[0].inputs, BTreeSet::from([spec("B")]));
    assert!(builder.unsatisfied().is_empty());
}

#[test]
fn test_missing_input_fails_strict_function() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B", "Missing"]).shared())
        .add(MockFunction::new("F2", &["B"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 0);
    assert_eq!(builder.unsatisfied().len(), 1);
}

#[test]
fn test_blocked_market_data_waits_without_spinning() {
    let calls = Arc::new(AtomicUsize::new(0));
    let market_data = SlowMarketData {
        available: spec("X"),
        ready_after: Duration::from_millis(250),
        first_call: Mutex::new(None),
        calls: calls.clone(),
    };
    let functions = FunctionRepository::new().add(MockFunction::new("F1", &["A"]).needs(&["X"]).shared());
    let builder = setup_with(functions, market_data).finish().unwrap();
    builder.add_target(requirement("A"));

    let started = Instant::now();
    let graph = builder.get_dependency_graph().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.leaf_nodes()[0].function.id(), MarketDataSourcingFunction::ID);
    // One question per wait interval, not one per loop iteration.
    let calls = calls.load(Ordering::Relaxed);
    assert!(calls < 20, "{calls} availability checks");
}

#[test]
fn test_late_resolution_to_actual_outputs() {
    let functions = FunctionRepository::new().add(
        MockFunction::with_properties("F", "PV", any_currency())
            .needs(&["Rate"])
            .producing(currency("USD"))
            .shared(),
    );
    let functions = functions.add(MockFunction::new("R", &["Rate"]).shared());
    let builder = builder(functions);
    builder.add_target(requirement("PV"));
    let graph = builder.get_dependency_graph().unwrap();

    assert!(builder.unsatisfied().is_empty());
    assert_eq!(graph.node_count(), 2);
    let (terminal, requirements) = graph.terminal_outputs().iter().next().unwrap();
    assert_eq!(terminal.properties(), &currency("USD"));
    assert_eq!(requirements, &BTreeSet::from([requirement("PV")]));
    let root = graph.root_nodes()[0];
    assert_eq!(root.outputs, BTreeSet::from([terminal.clone()]));
}

#[test]
fn test_late_resolution_outside_constraints_backtracks() {
    let functions = FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(
                MockFunction::with_properties("wrong", "PV", any_currency())
                    .producing(currency("USD"))
                    .shared(),
            ),
            10,
        )
        .add(MockFunction::with_properties("eur", "PV", currency("EUR")).shared());
    let builder = builder(functions);
    builder.add_target(ValueRequirement::new("PV", target(), currency("EUR")));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["eur".to_string()]));
}

#[test]
fn test_dependent_target_shares_shallower_task() {
    // The top-level A task stands in for the A that B needs.
    let functions = FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(MockFunction::new("F1", &["A"]).needs(&["B"]).shared()),
            10,
        )
        .add(MockFunction::new("F2", &["B"]).needs(&["A"]).shared())
        .add(MockFunction::new("F3", &["A"]).shared());
    let builder = builder(functions);
    builder.add_targets([requirement("A"), requirement("B")]);
    let graph = builder.get_dependency_graph().unwrap();

    assert!(builder.unsatisfied().is_empty());
    assert_eq!(function_ids(&graph), BTreeSet::from(["F2".to_string(), "F3".to_string()]));
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.terminal_outputs().len(), 2);
    assert!(graph.is_acyclic());
}

#[test]
fn test_mutually_dependent_targets_fail_without_hanging() {
    for threads in [0, 3] {
        let functions = FunctionRepository::new()
            .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
            .add(MockFunction::new("F2", &["B"]).needs(&["A"]).shared());
        let builder = setup(functions).max_additional_threads(threads).finish().unwrap();
        builder.add_targets([requirement("A"), requirement("B")]);
        let graph = builder.get_dependency_graph().unwrap();

        assert_eq!(graph.node_count(), 0);
        assert_eq!(builder.unsatisfied().len(), 2);
        assert!(builder.outstanding_requirements().is_empty());
        assert!(builder.is_graph_built().unwrap());
    }
}

#[test]
fn test_declining_function_backtracks() {
    let functions = FunctionRepository::new()
        .add_with_priority(ParameterizedFunction::of(MockFunction::new("F1", &["A"]).declining().shared()), 10)
        .add(MockFunction::new("F2", &["A"]).shared());
    let gatherer = Arc::new(ResolutionFailureGatherer::new());
    let builder = setup(functions).failure_listener(gatherer.clone()).finish().unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["F2".to_string()]));
    assert!(builder.unsatisfied().is_empty());
    assert!(gatherer.failures().is_empty());
}

#[test]
fn test_self_requirement_is_recursive() {
    let functions = FunctionRepository::new().add(MockFunction::new("F1", &["A"]).needs(&["A"]).shared());
    let alone = builder(functions);
    alone.add_target(requirement("A"));
    let graph = alone.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 0);
    assert_eq!(alone.unsatisfied().len(), 1);
    assert!(alone.outstanding_requirements().is_empty());

    let functions = FunctionRepository::new()
        .add_with_priority(
            ParameterizedFunction::of(MockFunction::new("F1", &["A"]).needs(&["A"]).shared()),
            10,
        )
        .add(MockFunction::new("F2", &["A"]).shared());
    let with_alternative = builder(functions);
    with_alternative.add_target(requirement("A"));
    let graph = with_alternative.get_dependency_graph().unwrap();

    assert_eq!(function_ids(&graph), BTreeSet::from(["F2".to_string()]));
}

#[test]
fn test_targets_added_from_many_threads() {
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B"]).shared());
    let builder = setup(functions).max_additional_threads(2).finish().unwrap();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| builder.add_target(requirement("A")));
        }
    });
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.terminal_outputs().len(), 1);
    assert_eq!(
        builder.value_requirement_mapping()[&spec("A")],
        BTreeSet::from([requirement("A")])
    );
    assert!(builder.outstanding_requirements().is_empty());
}

#[test]
fn test_every_run_queue_builds_same_graph() {
    for kind in [RunQueueKind::Fifo, RunQueueKind::Stack, RunQueueKind::Ordered] {
        let functions = FunctionRepository::new()
            .add(MockFunction::new("F1", &["A"]).needs(&["C"]).shared())
            .add(MockFunction::new("F2", &["B"]).needs(&["C", "D"]).shared())
            .add(MockFunction::new("F3", &["C"]).needs(&["D"]).shared())
            .add(MockFunction::new("F4", &["D"]).shared());
        let builder = setup(functions).run_queue(kind).finish().unwrap();
        builder.add_targets([requirement("A"), requirement("B")]);
        let graph = builder.get_dependency_graph().unwrap();

        assert_eq!(graph.node_count(), 4, "{kind:?}");
        assert_eq!(graph.graph().edge_count(), 4, "{kind:?}");
        assert!(builder.unsatisfied().is_empty(), "{kind:?}");
    }
}

#[test]
fn test_idle_build_drops_unplaced_productions() {
    let builder = builder(FunctionRepository::new().add(MockFunction::new("F", &["A"]).shared()));
    builder.add_target(requirement("A"));
    builder.get_dependency_graph().unwrap();

    // A production nothing holds as a result any more.
    let stray = ResolvedValue::new(
        spec("B"),
        ParameterizedFunction::of(MockFunction::new("G", &["B"]).shared()),
        BTreeSet::new(),
        BTreeSet::from([spec("B")]),
    );
    builder.state.terminal.declare_production(Arc::new(stray));
    assert_eq!(builder.state.evict_unplaced_productions(), 1);
    assert!(builder.state.terminal.get_production(&spec("B")).is_none());
    assert!(builder.state.terminal.get_production(&spec("A")).is_some());
}

#[test]
fn test_build_survives_aggressive_cache_flushing() {
    let config = BuilderConfig {
        max_additional_threads: 0,
        cleanup_interval: 1,
        ..BuilderConfig::default()
    };
    let functions = FunctionRepository::new()
        .add(MockFunction::new("F1", &["A"]).needs(&["B"]).shared())
        .add(MockFunction::new("F2", &["B"]).needs(&["C"]).shared())
        .add(MockFunction::new("F3", &["C"]).shared());
    let builder = setup(functions)
        .config(config)
        .cleanup_policy(EntryCountPolicy { max_entries: 0 })
        .finish()
        .unwrap();
    builder.add_target(requirement("A"));
    let graph = builder.get_dependency_graph().unwrap();

    assert_eq!(graph.node_count(), 3);
    assert!(builder.unsatisfied().is_empty());

    // Later targets still find their way after the flushes.
    builder.add_target(requirement("B"));
    let graph = builder.get_dependency_graph().unwrap();
    assert_eq!(graph.node_count(), 3);
    assert_eq!(graph.terminal_outputs().len(), 2);
}
