//! Resolves a small pricing graph and prints it as a Mermaid diagram.
//!
//! Run with `cargo run --example resolve --features logging`, and
//! `RUST_LOG=depgraph=debug` for the resolution traffic.
use std::collections::BTreeSet;
use std::sync::Arc;

use depgraph::failure::{FailurePrinter, ResolutionFailureGatherer};
use depgraph::function::{
    CompilationContext, FixedMarketDataProvider, FunctionDefinition, FunctionRepository,
};
use depgraph::value::{TargetSpecification, ValueProperties, ValueRequirement, ValueSpecification};
use depgraph::{DependencyGraphBuilder, init_logging};

/// Produces one value on a target from other values on the same target.
struct Formula {
    id: &'static str,
    output: &'static str,
    inputs: &'static [&'static str],
}

impl FunctionDefinition for Formula {
    fn id(&self) -> &str {
        self.id
    }

    fn nominal_results(&self, target: &TargetSpecification) -> Option<BTreeSet<ValueSpecification>> {
        let properties = ValueProperties::builder().with("Function", self.id).build();
        Some(BTreeSet::from([ValueSpecification::new(self.output, target.clone(), properties)]))
    }

    fn get_requirements(
        &self,
        _: &CompilationContext,
        target: &TargetSpecification,
        _: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>> {
        Ok(Some(
            self.inputs
                .iter()
                .map(|input| ValueRequirement::of(input, target.clone()))
                .collect(),
        ))
    }
}

fn main() -> anyhow::Result<()> {
    init_logging()?;

    let functions = FunctionRepository::new()
        .add(Arc::new(Formula { id: "SwapPV", output: "PV", inputs: &["Curve", "Notional"] }))
        .add(Arc::new(Formula { id: "CurveBuilder", output: "Curve", inputs: &["Rate"] }))
        .add(Arc::new(Formula { id: "Greeks", output: "Delta", inputs: &["PV", "Vol"] }));

    let swap = TargetSpecification::primitive("Swap");
    let market_data = FixedMarketDataProvider::new()
        .available(ValueSpecification::new("Rate", swap.clone(), ValueProperties::none()))
        .available(ValueSpecification::new("Notional", swap.clone(), ValueProperties::none()))
        .missing("Vol", swap.clone());

    let failures = Arc::new(ResolutionFailureGatherer::new());
    let builder = DependencyGraphBuilder::setup()
        .market_data(Arc::new(market_data))
        .functions(functions.into_resolver())
        .failure_listener(failures.clone())
        .finish()?;

    builder.add_targets([
        ValueRequirement::of("PV", swap.clone()),
        ValueRequirement::of("Delta", swap),
    ]);
    let mut graph = builder.get_dependency_graph()?;
    graph.remove_unnecessary_values();

    println!("{graph}");
    for failure in failures.failures() {
        println!("{}", FailurePrinter::print(&failure));
    }
    for (message, count) in builder.exceptions() {
        println!("{count:>4} x {message}");
    }
    Ok(())
}
