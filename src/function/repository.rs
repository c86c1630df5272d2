use std::cmp::Reverse;
use std::sync::Arc;

use crate::function::{
    CandidateIter, FunctionCandidate, FunctionDefinition, FunctionResolver, ParameterizedFunction,
};
use crate::value::{TargetSpecification, ValueProperties};

struct Entry {
    function: ParameterizedFunction,
    priority: i32,
}

/// In-memory function catalog.
///
/// Candidates come out in descending priority, ties in registration order. The
/// catalog is immutable once shared, so enumeration holds no lock.
#[derive(Default)]
pub struct FunctionRepository {
    entries: Vec<Entry>,
}

impl FunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(self, function: Arc<dyn FunctionDefinition>) -> Self {
        self.add_with_priority(ParameterizedFunction::of(function), 0)
    }

    pub fn add_with_priority(mut self, function: ParameterizedFunction, priority: i32) -> Self {
        self.entries.push(Entry { function, priority });
        self.entries.sort_by_key(|entry| Reverse(entry.priority));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_resolver(self) -> Arc<dyn FunctionResolver> {
        Arc::new(SharedRepository(Arc::new(self.entries)))
    }
}

struct SharedRepository(Arc<Vec<Entry>>);

impl FunctionResolver for SharedRepository {
    fn resolve_function(
        &self,
        value_name: &str,
        target: &TargetSpecification,
        constraints: &ValueProperties,
    ) -> anyhow::Result<CandidateIter> {
        Ok(Box::new(Candidates {
            entries: self.0.clone(),
            next: 0,
            value_name: value_name.to_string(),
            target: target.clone(),
            constraints: constraints.clone(),
        }))
    }
}

/// Walks the catalog one function at a time, asking each for its nominal
/// outputs only when reached.
struct Candidates {
    entries: Arc<Vec<Entry>>,
    next: usize,
    value_name: String,
    target: TargetSpecification,
    constraints: ValueProperties,
}

impl Iterator for Candidates {
    type Item = FunctionCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.entries.get(self.next) {
            self.next += 1;

            let Some(outputs) = entry.function.definition().nominal_results(&self.target) else {
                continue;
            };

            let matching = outputs.iter().find(|output| {
                output.name() == self.value_name
                    && output.target() == &self.target
                    && self.constraints.is_satisfied_by(output.properties())
            });

            if let Some(output) = matching {
                return Some(FunctionCandidate {
                    function: entry.function.clone(),
                    output: output.clone(),
                    outputs: outputs.clone(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::function::CompilationContext;
    use crate::value::{ValueRequirement, ValueSpecification};

    struct Produces(&'static str, &'static str);

    impl FunctionDefinition for Produces {
        fn id(&self) -> &str {
            self.0
        }

        fn nominal_results(&self, target: &TargetSpecification) -> Option<BTreeSet<ValueSpecification>> {
            Some(BTreeSet::from([ValueSpecification::new(
                self.1,
                target.clone(),
                ValueProperties::builder().with("Function", self.0).build(),
            )]))
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

    #[test]
    fn test_candidates_follow_priority() {
        let resolver = FunctionRepository::new()
            .add_with_priority(ParameterizedFunction::of(Arc::new(Produces("low", "A"))), 1)
            .add_with_priority(ParameterizedFunction::of(Arc::new(Produces("high", "A"))), 10)
            .add(Arc::new(Produces("other", "B")))
            .into_resolver();

        let target = TargetSpecification::primitive("T");
        let ids: Vec<String> = resolver
            .resolve_function("A", &target, &ValueProperties::none())
            .unwrap()
            .map(|c| c.function.id().to_string())
            .collect();
        assert_eq!(ids, ["high", "low"]);
    }

    #[test]
    fn test_constraints_filter_candidates() {
        let resolver = FunctionRepository::new()
            .add(Arc::new(Produces("foo", "A")))
            .add(Arc::new(Produces("bar", "A")))
            .into_resolver();

        let target = TargetSpecification::primitive("T");
        let wanted = ValueProperties::builder().with("Function", "bar").build();
        let candidates: Vec<_> = resolver
            .resolve_function("A", &target, &wanted)
            .unwrap()
            .collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].function.id(), "bar");
        assert!(candidates[0].outputs.contains(&candidates[0].output));
    }
}
