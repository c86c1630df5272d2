use std::fmt::{self, Display};

use serde::Serialize;

use crate::core::ArcStr;

/// A fully resolved computation target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TargetSpecification {
    pub kind: ArcStr,
    pub identifier: ArcStr,
}

impl TargetSpecification {
    pub fn new(kind: &str, identifier: &str) -> Self {
        Self {
            kind: kind.into(),
            identifier: identifier.into(),
        }
    }

    /// Target of kind `PRIMITIVE`, the usual choice when the kind carries no meaning.
    pub fn primitive(identifier: &str) -> Self {
        Self::new("PRIMITIVE", identifier)
    }
}

impl Display for TargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.kind, self.identifier)
    }
}

/// A symbolic pointer at a target, resolved by a
/// [`TargetResolver`](crate::function::TargetResolver) before any function runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TargetReference {
    /// Already resolved.
    Specification(TargetSpecification),
    /// An external identifier that still needs looking up.
    External { kind: ArcStr, identifier: ArcStr },
}

impl TargetReference {
    pub fn external(kind: &str, identifier: &str) -> Self {
        Self::External {
            kind: kind.into(),
            identifier: identifier.into(),
        }
    }

    pub fn specification(&self) -> Option<&TargetSpecification> {
        match self {
            TargetReference::Specification(spec) => Some(spec),
            TargetReference::External { .. } => None,
        }
    }

    /// Whether this reference points at `target` without needing resolution.
    pub fn refers_to(&self, target: &TargetSpecification) -> bool {
        self.specification() == Some(target)
    }
}

impl From<TargetSpecification> for TargetReference {
    fn from(value: TargetSpecification) -> Self {
        TargetReference::Specification(value)
    }
}

impl From<&TargetSpecification> for TargetReference {
    fn from(value: &TargetSpecification) -> Self {
        TargetReference::Specification(value.clone())
    }
}

impl Display for TargetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetReference::Specification(spec) => spec.fmt(f),
            TargetReference::External { kind, identifier } => write!(f, "{kind}~ext:{identifier}"),
        }
    }
}
