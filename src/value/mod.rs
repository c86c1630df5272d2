//! Immutable identifiers for what is wanted and what gets produced.
mod intern;
mod properties;
mod resolved;
mod target;

use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::core::ArcStr;

pub use properties::{PropertyValues, ValueProperties, ValuePropertiesBuilder};
pub use resolved::ResolvedValue;
pub use target::{TargetReference, TargetSpecification};

#[cfg(test)]
pub(crate) use intern::live_count as interned_specifications;

/// An abstract request for a named value on a target, narrowed by constraints.
///
/// Many requirements may be satisfied by the same [`ValueSpecification`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ValueRequirement {
    name: ArcStr,
    target: TargetReference,
    constraints: ValueProperties,
}

impl ValueRequirement {
    pub fn new(name: &str, target: impl Into<TargetReference>, constraints: ValueProperties) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            constraints,
        }
    }

    /// Requirement without any constraints.
    pub fn of(name: &str, target: impl Into<TargetReference>) -> Self {
        Self::new(name, target, ValueProperties::none())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &TargetReference {
        &self.target
    }

    pub fn constraints(&self) -> &ValueProperties {
        &self.constraints
    }

    /// Whether `spec` is an acceptable answer to this requirement.
    pub fn is_satisfied_by(&self, spec: &ValueSpecification) -> bool {
        self.name() == spec.name()
            && self.target.refers_to(spec.target())
            && self.constraints.is_satisfied_by(spec.properties())
    }
}

impl Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.target)?;
        if !self.constraints.is_empty() {
            write!(f, "{}", self.constraints)?;
        }
        Ok(())
    }
}

/// A concrete, normalized output: name, resolved target and full property set.
///
/// Instances are interned, equality and hashing go by pointer. Ordering is
/// structural so sets of specifications iterate deterministically.
#[derive(Clone)]
pub struct ValueSpecification(Arc<intern::SpecData>);

impl ValueSpecification {
    pub fn new(name: &str, target: TargetSpecification, properties: ValueProperties) -> Self {
        Self(intern::intern(intern::SpecData {
            name: name.into(),
            target,
            properties,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.0.target
    }

    pub fn properties(&self) -> &ValueProperties {
        &self.0.properties
    }

    /// Same name and target with a different property set.
    pub fn with_properties(&self, properties: ValueProperties) -> Self {
        if properties == self.0.properties {
            return self.clone();
        }
        Self::new(self.name(), self.target().clone(), properties)
    }

    /// Narrows this nominal output to the constraints of `requirement`.
    pub fn compose(&self, requirement: &ValueRequirement) -> Self {
        self.with_properties(self.properties().compose(requirement.constraints()))
    }

    /// The requirement this specification satisfies exactly.
    pub fn to_requirement(&self) -> ValueRequirement {
        ValueRequirement::new(self.name(), self.target(), self.properties().clone())
    }
}

impl PartialEq for ValueSpecification {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ValueSpecification {}

impl Hash for ValueSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl PartialOrd for ValueSpecification {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueSpecification {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if Arc::ptr_eq(&self.0, &other.0) {
            return std::cmp::Ordering::Equal;
        }
        (*self.0).cmp(&*other.0)
    }
}

impl Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name(), self.target())?;
        if !self.properties().is_empty() {
            write!(f, "{}", self.properties())?;
        }
        Ok(())
    }
}

impl Debug for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueSpecification({self})")
    }
}

impl Serialize for ValueSpecification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ValueSpecification", 3)?;
        state.serialize_field("name", self.name())?;
        state.serialize_field("target", self.target())?;
        state.serialize_field("properties", self.properties())?;
        state.end()
    }
}
