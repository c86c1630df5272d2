use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use serde::Serialize;

use crate::core::ArcStr;

/// The values a single property may take.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PropertyValues {
    /// Wildcard. On a produced value it means "any value can be produced", on a
    /// constraint it means "any value is acceptable".
    Any,
    /// A non-empty set of acceptable (or produced) values.
    Values(BTreeSet<ArcStr>),
}

impl PropertyValues {
    fn intersects(&self, other: &PropertyValues) -> bool {
        match (self, other) {
            (PropertyValues::Any, _) | (_, PropertyValues::Any) => true,
            (PropertyValues::Values(a), PropertyValues::Values(b)) => !a.is_disjoint(b),
        }
    }
}

/// Immutable bag of named properties attached to requirements and specifications.
///
/// Cloning is cheap, the map is shared behind an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct ValueProperties(Arc<BTreeMap<ArcStr, PropertyValues>>);

impl ValueProperties {
    /// Empty property bag, satisfied by anything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> ValuePropertiesBuilder {
        ValuePropertiesBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValues> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValues)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Checks whether `properties` can satisfy every constraint held by `self`.
    ///
    /// A constraint is met when the other bag carries the same property name with
    /// an intersecting value set, or with a wildcard on either side.
    pub fn is_satisfied_by(&self, properties: &ValueProperties) -> bool {
        if Arc::ptr_eq(&self.0, &properties.0) {
            return true;
        }
        self.0.iter().all(|(name, wanted)| match properties.0.get(name) {
            Some(have) => wanted.intersects(have),
            None => false,
        })
    }

    /// Narrows this (produced) property bag to the values requested by
    /// `constraints`.
    ///
    /// Wildcards take the requested values, concrete sets are intersected with
    /// them. Names only present in `constraints` are ignored since a producer
    /// cannot be made to emit properties it never declared. Returns a clone of
    /// `self` when nothing changes.
    pub fn compose(&self, constraints: &ValueProperties) -> ValueProperties {
        let mut changed = false;
        let mut composed = BTreeMap::new();

        for (name, have) in self.0.iter() {
            let value = match (have, constraints.0.get(name)) {
                (PropertyValues::Any, Some(PropertyValues::Values(wanted))) => {
                    changed = true;
                    PropertyValues::Values(wanted.clone())
                }
                (PropertyValues::Values(have), Some(PropertyValues::Values(wanted))) => {
                    let narrowed: BTreeSet<_> = have.intersection(wanted).cloned().collect();
                    if narrowed.is_empty() || narrowed.len() == have.len() {
                        PropertyValues::Values(have.clone())
                    } else {
                        changed = true;
                        PropertyValues::Values(narrowed)
                    }
                }
                (have, _) => have.clone(),
            };
            composed.insert(name.clone(), value);
        }

        if changed {
            ValueProperties(Arc::new(composed))
        } else {
            self.clone()
        }
    }
}

impl Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, values)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match values {
                PropertyValues::Any => write!(f, "{name}=*")?,
                PropertyValues::Values(values) => {
                    write!(f, "{name}=")?;
                    if values.len() == 1 {
                        write!(f, "{}", values.iter().next().map(|v| v.as_ref()).unwrap_or(""))?;
                    } else {
                        let joined: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
                        write!(f, "[{}]", joined.join(","))?;
                    }
                }
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Default)]
pub struct ValuePropertiesBuilder {
    map: BTreeMap<ArcStr, PropertyValues>,
}

impl ValuePropertiesBuilder {
    /// Adds a value for `name`, merging with values already present.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        let entry = self
            .map
            .entry(ArcStr::from(name))
            .or_insert_with(|| PropertyValues::Values(BTreeSet::new()));
        if let PropertyValues::Values(values) = entry {
            values.insert(ArcStr::from(value));
        }
        self
    }

    /// Marks `name` as a wildcard.
    pub fn with_any(mut self, name: &str) -> Self {
        self.map.insert(ArcStr::from(name), PropertyValues::Any);
        self
    }

    pub fn build(self) -> ValueProperties {
        ValueProperties(Arc::new(self.map))
    }
}
