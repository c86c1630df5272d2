use std::collections::HashMap;
use std::sync::Mutex;

use crate::value::ValueRequirement;

/// Top-level requirements still waiting for their first result or failure.
///
/// The same requirement may be added more than once, each addition is answered
/// separately.
#[derive(Debug, Default)]
pub(crate) struct PendingRequirements(Mutex<HashMap<ValueRequirement, usize>>);

impl PendingRequirements {
    pub(crate) fn add(&self, requirement: &ValueRequirement) {
        *self
            .0
            .lock()
            .unwrap()
            .entry(requirement.clone())
            .or_default() += 1;
    }

    /// One addition of `requirement` got its answer.
    pub(crate) fn remove(&self, requirement: &ValueRequirement) {
        let mut pending = self.0.lock().unwrap();
        if let Some(count) = pending.get_mut(requirement) {
            *count -= 1;
            if *count == 0 {
                pending.remove(requirement);
            }
        }
    }

    pub(crate) fn outstanding(&self) -> Vec<ValueRequirement> {
        let mut outstanding: Vec<_> = self.0.lock().unwrap().keys().cloned().collect();
        outstanding.sort();
        outstanding
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TargetSpecification;

    #[test]
    fn test_repeated_requirement_counts() {
        let pending = PendingRequirements::default();
        let a = ValueRequirement::of("A", TargetSpecification::primitive("T"));
        let b = ValueRequirement::of("B", TargetSpecification::primitive("T"));
        pending.add(&a);
        pending.add(&a);
        pending.add(&b);
        assert_eq!(pending.outstanding(), [a.clone(), b.clone()]);

        pending.remove(&a);
        pending.remove(&b);
        assert_eq!(pending.outstanding(), [a.clone()]);
        pending.remove(&a);
        // unknown requirements are ignored
        pending.remove(&b);
        assert!(pending.is_empty());
    }
}
