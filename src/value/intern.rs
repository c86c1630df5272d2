//! Global interning table for value specifications.
//!
//! Every [`ValueSpecification`](super::ValueSpecification) is created through
//! [`intern`], so two structurally equal specifications always share the same
//! allocation and the caches can compare them by pointer.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use crate::core::ArcStr;
use crate::value::{TargetSpecification, ValueProperties};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SpecData {
    pub(crate) name: ArcStr,
    pub(crate) target: TargetSpecification,
    pub(crate) properties: ValueProperties,
}

const MIN_SWEEP_THRESHOLD: usize = 1024;

struct Interner {
    table: HashMap<SpecData, Weak<SpecData>>,
    sweep_at: usize,
}

static INTERNER: LazyLock<Mutex<Interner>> = LazyLock::new(|| {
    Mutex::new(Interner {
        table: HashMap::new(),
        sweep_at: MIN_SWEEP_THRESHOLD,
    })
});

pub(crate) fn intern(data: SpecData) -> Arc<SpecData> {
    let mut interner = INTERNER.lock().unwrap();

    if let Some(existing) = interner.table.get(&data).and_then(Weak::upgrade) {
        return existing;
    }

    let shared = Arc::new(data.clone());
    interner.table.insert(data, Arc::downgrade(&shared));

    // Dead entries are only dropped in bulk, the table never shrinks below the
    // live set.
    if interner.table.len() > interner.sweep_at {
        interner.table.retain(|_, weak| weak.strong_count() > 0);
        interner.sweep_at = (interner.table.len() * 2).max(MIN_SWEEP_THRESHOLD);
    }

    shared
}

/// Number of live interned specifications.
#[cfg(test)]
pub(crate) fn live_count() -> usize {
    let interner = INTERNER.lock().unwrap();
    interner
        .table
        .values()
        .filter(|weak| weak.strong_count() > 0)
        .count()
}
