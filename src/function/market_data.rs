use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::AvailabilityError;
use crate::function::{CompilationContext, FunctionDefinition, ParameterizedFunction};
use crate::value::{ResolvedValue, TargetSpecification, ValueRequirement, ValueSpecification};

/// Answers whether a wanted value is available from outside the graph.
pub trait MarketDataAvailabilityProvider: Send + Sync {
    /// `Ok(Some(spec))` when available, `Ok(None)` when unknown and functions
    /// should be tried, [`AvailabilityError::NotSatisfiable`] when it is known
    /// to be absent and [`AvailabilityError::WouldBlock`] when the answer is not
    /// ready yet.
    fn get_availability(
        &self,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, AvailabilityError>;
}

/// No market data at all, every value has to come from a function.
#[derive(Debug, Default)]
pub struct NoMarketData;

impl MarketDataAvailabilityProvider for NoMarketData {
    fn get_availability(
        &self,
        _: &TargetSpecification,
        _: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, AvailabilityError> {
        Ok(None)
    }
}

/// A fixed table of available values and of values known to be missing.
#[derive(Debug, Default)]
pub struct FixedMarketDataProvider {
    available: Vec<ValueSpecification>,
    missing: HashSet<(ArcStr, TargetSpecification)>,
}

impl FixedMarketDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(mut self, spec: ValueSpecification) -> Self {
        self.available.push(spec);
        self
    }

    pub fn missing(mut self, name: &str, target: TargetSpecification) -> Self {
        self.missing.insert((name.into(), target));
        self
    }
}

impl MarketDataAvailabilityProvider for FixedMarketDataProvider {
    fn get_availability(
        &self,
        target: &TargetSpecification,
        desired: &ValueRequirement,
    ) -> Result<Option<ValueSpecification>, AvailabilityError> {
        let found = self.available.iter().find(|spec| {
            spec.name() == desired.name()
                && spec.target() == target
                && desired.constraints().is_satisfied_by(spec.properties())
        });

        match found {
            Some(spec) => Ok(Some(spec.clone())),
            None if self.missing.contains(&(desired.name().into(), target.clone())) => {
                Err(AvailabilityError::NotSatisfiable)
            }
            None => Ok(None),
        }
    }
}

/// Intrinsic function standing behind every market data leaf of the graph.
#[derive(Debug, Default)]
pub struct MarketDataSourcingFunction;

impl MarketDataSourcingFunction {
    pub const ID: &'static str = "MarketDataSourcingFunction";
}

impl FunctionDefinition for MarketDataSourcingFunction {
    fn id(&self) -> &str {
        Self::ID
    }

    fn nominal_results(&self, _: &TargetSpecification) -> Option<BTreeSet<ValueSpecification>> {
        None
    }

    fn get_requirements(
        &self,
        _: &CompilationContext,
        _: &TargetSpecification,
        _: &ValueRequirement,
    ) -> anyhow::Result<Option<BTreeSet<ValueRequirement>>> {
        Ok(Some(BTreeSet::new()))
    }
}

/// The leaf resolution for a value found in market data.
pub(crate) fn market_data_value(spec: ValueSpecification) -> ResolvedValue {
    let function = ParameterizedFunction::of(Arc::new(MarketDataSourcingFunction));
    let outputs = BTreeSet::from([spec.clone()]);
    ResolvedValue::new(spec, function, BTreeSet::new(), outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueProperties;

    #[test]
    fn test_fixed_provider() {
        let target = TargetSpecification::primitive("T");
        let spec = ValueSpecification::new("Price", target.clone(), ValueProperties::none());
        let provider = FixedMarketDataProvider::new()
            .available(spec.clone())
            .missing("Volume", target.clone());

        let found = provider
            .get_availability(&target, &ValueRequirement::of("Price", &target))
            .unwrap();
        assert_eq!(found, Some(spec));

        let missing = provider.get_availability(&target, &ValueRequirement::of("Volume", &target));
        assert!(matches!(missing, Err(AvailabilityError::NotSatisfiable)));

        let unknown = provider
            .get_availability(&target, &ValueRequirement::of("Other", &target))
            .unwrap();
        assert!(unknown.is_none());
    }
}
