//! Thread-safe holders of schedulable work.
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

use crate::core::ArcStr;
use crate::engine::Runnable;
use crate::error::ConfigError;
use crate::value::TargetSpecification;

/// Which [`RunQueue`] the builder schedules work on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RunQueueKind {
    /// First in, first out. Breadth-first exploration.
    #[default]
    Fifo,
    /// Last in, first out. Depth-first, keeps the working set small.
    Stack,
    /// Pending callbacks first, then tasks grouped by target and value name.
    Ordered,
}

impl FromStr for RunQueueKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(RunQueueKind::Fifo),
            "stack" | "lifo" => Ok(RunQueueKind::Stack),
            "ordered" | "priority" => Ok(RunQueueKind::Ordered),
            _ => Err(ConfigError::InvalidValue("DEPGRAPH_RUN_QUEUE", s.to_string())),
        }
    }
}

impl RunQueueKind {
    pub(crate) fn create(self) -> Box<dyn RunQueue> {
        match self {
            RunQueueKind::Fifo => Box::new(FifoRunQueue::default()),
            RunQueueKind::Stack => Box::new(StackRunQueue::default()),
            RunQueueKind::Ordered => Box::new(OrderedRunQueue::default()),
        }
    }
}

/// Ordering hint a unit of work may expose to the ordered queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RunPriority {
    pub target: TargetSpecification,
    pub value_name: ArcStr,
}

pub(crate) trait RunQueue: Send + Sync {
    fn is_empty(&self) -> bool;
    /// Approximate under concurrent modification.
    fn len(&self) -> usize;
    fn add(&self, runnable: Runnable);
    fn take(&self) -> Option<Runnable>;
}

#[derive(Default)]
pub(crate) struct FifoRunQueue(Mutex<VecDeque<Runnable>>);

impl RunQueue for FifoRunQueue {
    fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn add(&self, runnable: Runnable) {
        self.0.lock().unwrap().push_back(runnable);
    }

    fn take(&self) -> Option<Runnable> {
        self.0.lock().unwrap().pop_front()
    }
}

#[derive(Default)]
pub(crate) struct StackRunQueue(Mutex<Vec<Runnable>>);

impl RunQueue for StackRunQueue {
    fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn add(&self, runnable: Runnable) {
        self.0.lock().unwrap().push(runnable);
    }

    fn take(&self) -> Option<Runnable> {
        self.0.lock().unwrap().pop()
    }
}

struct Prioritized {
    priority: Option<RunPriority>,
    sequence: u64,
    runnable: Runnable,
}

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    // BinaryHeap pops the greatest element, so "runs first" must compare greater.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_priority = match (&self.priority, &other.priority) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => b.cmp(a),
        };
        by_priority.then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
pub(crate) struct OrderedRunQueue {
    heap: Mutex<BinaryHeap<Prioritized>>,
    sequence: AtomicU64,
}

impl RunQueue for OrderedRunQueue {
    fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    fn add(&self, runnable: Runnable) {
        let entry = Prioritized {
            priority: runnable.priority(),
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            runnable,
        };
        self.heap.lock().unwrap().push(entry);
    }

    fn take(&self) -> Option<Runnable> {
        self.heap.lock().unwrap().pop().map(|entry| entry.runnable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::{ContextRunnable, GraphBuildingContext};

    struct Marker(u32, Option<RunPriority>);

    impl ContextRunnable for Marker {
        fn try_run(&self, _: &mut GraphBuildingContext) -> bool {
            true
        }

        fn priority(&self) -> Option<RunPriority> {
            self.1.clone()
        }

        fn label(&self) -> String {
            self.0.to_string()
        }
    }

    fn marker(id: u32) -> Runnable {
        Arc::new(Marker(id, None))
    }

    fn drain(queue: &dyn RunQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.take()).map(|r| r.label()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = RunQueueKind::Fifo.create();
        assert!(queue.is_empty());
        for i in 0..3 {
            queue.add(marker(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(queue.as_ref()), ["0", "1", "2"]);
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_stack_order() {
        let queue = RunQueueKind::Stack.create();
        for i in 0..3 {
            queue.add(marker(i));
        }
        assert_eq!(drain(queue.as_ref()), ["2", "1", "0"]);
    }

    #[test]
    fn test_ordered_groups_by_target() {
        let queue = RunQueueKind::Ordered.create();
        let priority = |target: &str, name: &str| {
            Some(RunPriority {
                target: TargetSpecification::primitive(target),
                value_name: name.into(),
            })
        };
        queue.add(Arc::new(Marker(0, priority("B", "X"))));
        queue.add(Arc::new(Marker(1, priority("A", "Y"))));
        queue.add(Arc::new(Marker(2, None)));
        queue.add(Arc::new(Marker(3, priority("A", "X"))));
        queue.add(Arc::new(Marker(4, priority("A", "X"))));
        assert_eq!(drain(queue.as_ref()), ["2", "3", "4", "1", "0"]);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("FIFO".parse::<RunQueueKind>().unwrap(), RunQueueKind::Fifo);
        assert_eq!("lifo".parse::<RunQueueKind>().unwrap(), RunQueueKind::Stack);
        assert_eq!("ordered".parse::<RunQueueKind>().unwrap(), RunQueueKind::Ordered);
        assert!("random".parse::<RunQueueKind>().is_err());
    }
}
