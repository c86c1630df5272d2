use std::collections::BTreeSet;
use std::fmt::{self, Display};

use crate::function::ParameterizedFunction;
use crate::value::ValueSpecification;

/// One candidate answer to a requirement: the value, the function application
/// producing it, what that application consumes and everything else it emits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedValue {
    specification: ValueSpecification,
    function: ParameterizedFunction,
    inputs: BTreeSet<ValueSpecification>,
    outputs: BTreeSet<ValueSpecification>,
}

impl ResolvedValue {
    /// # Panics
    ///
    /// When `specification` is not among `outputs` or is among `inputs`. Either
    /// would corrupt the production caches.
    pub fn new(
        specification: ValueSpecification,
        function: ParameterizedFunction,
        inputs: BTreeSet<ValueSpecification>,
        outputs: BTreeSet<ValueSpecification>,
    ) -> Self {
        assert!(
            outputs.contains(&specification),
            "resolved value {specification} missing from its own outputs"
        );
        assert!(
            !inputs.contains(&specification),
            "resolved value {specification} consumes itself"
        );
        Self {
            specification,
            function,
            inputs,
            outputs,
        }
    }

    pub fn specification(&self) -> &ValueSpecification {
        &self.specification
    }

    pub fn function(&self) -> &ParameterizedFunction {
        &self.function
    }

    pub fn inputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.outputs
    }
}

impl Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by {} ({} inputs, {} outputs)",
            self.specification,
            self.function,
            self.inputs.len(),
            self.outputs.len()
        )
    }
}
