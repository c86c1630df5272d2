use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for engine objects, only used to tell them apart in logs.
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runs a collaborator call, turning a panic into an error.
///
/// A misbehaving function must only fail the candidate it was asked about, so
/// the unwind is stopped here. The engine's own state is never borrowed across
/// the call.
pub(crate) fn guarded<T>(call: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Function panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Function panicked: {s}")
            } else {
                String::from("Function panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_converts_panics() {
        let result: anyhow::Result<()> = guarded(|| panic!("boom"));
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Function panicked: boom");
    }

    #[test]
    fn test_guarded_passes_results_through() {
        assert_eq!(guarded(|| Ok(3)).unwrap(), 3);
        assert!(guarded::<()>(|| Err(anyhow::anyhow!("no"))).is_err());
    }

    #[test]
    fn test_object_ids_are_unique() {
        assert_ne!(next_object_id(), next_object_id());
    }
}
