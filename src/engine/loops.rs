use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use crate::engine::{GraphBuildingContext, ProducerRef, producer_key};

/// Breaks cycles of producers waiting on each other.
///
/// Only meaningful once the run queue is empty: any subscription still waiting
/// then can only be satisfied by another waiting producer. Every waiting
/// subscription whose producer and owner sit on the same cycle is failed as
/// recursive, which lets the rest of the cycle move on to other candidates.
/// Returns the number of subscriptions failed.
pub(crate) fn abort_loops(ctx: &mut GraphBuildingContext) -> usize {
    let producers = snapshot(ctx);
    let mut edges = Vec::new();
    let mut waiting = Vec::new();
    for producer in producers.values() {
        let from = producer_key(producer);
        for (subscription, callback) in producer.core().waiting_subscriptions() {
            if let Some(owner) = callback.owner() {
                let to = producer_key(&owner);
                edges.push((from, to));
                waiting.push((producer.clone(), subscription, to));
            }
        }
        for dependent in producer.blocked_dependents() {
            edges.push((from, producer_key(&dependent)));
        }
    }

    let cycles = blocked_cycles(&edges);
    if cycles.is_empty() {
        debug!(producers = producers.len(), "no resolution loops");
        return 0;
    }

    let mut cancelled = 0;
    for (producer, subscription, owner) in waiting {
        let from = producer_key(&producer);
        if let (Some(a), Some(b)) = (cycles.get(&from), cycles.get(&owner))
            && a == b
        {
            let failure = ctx.recursive_requirement(producer.requirement());
            if producer.core().cancel_waiting(ctx, subscription, failure) {
                debug!(producer = producer.core().id(), requirement = %producer.requirement(), "loop broken");
                cancelled += 1;
            }
        }
    }
    info!(cancelled, "aborted resolution loops");
    cancelled
}

/// Every producer reachable from the caches through waiting subscriptions.
fn snapshot(ctx: &GraphBuildingContext) -> HashMap<usize, ProducerRef> {
    let state = ctx.state();
    let mut pending: Vec<ProducerRef> = Vec::new();
    state.requirements.for_each(|_, tasks| {
        pending.extend(tasks.values().map(|task| task.clone() as ProducerRef));
    });
    state.specifications.for_each(|_, entry| {
        if let Some(entry) = entry {
            pending.push(entry.producer.clone());
        }
    });

    let mut seen = HashMap::new();
    while let Some(producer) = pending.pop() {
        let key = producer_key(&producer);
        if seen.contains_key(&key) {
            continue;
        }
        pending.extend(
            producer
                .core()
                .waiting_subscriptions()
                .into_iter()
                .filter_map(|(_, callback)| callback.owner()),
        );
        pending.extend(producer.blocked_dependents());
        seen.insert(key, producer);
    }
    seen
}

/// Maps every node on a cycle of `edges` to the index of its strongly
/// connected component.
fn blocked_cycles(edges: &[(usize, usize)]) -> HashMap<usize, usize> {
    let graph: DiGraphMap<usize, ()> = DiGraphMap::from_edges(edges.iter().copied());
    let mut members = HashMap::new();
    for (index, component) in tarjan_scc(&graph).into_iter().enumerate() {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&node| graph.contains_edge(node, node));
        if cyclic {
            members.extend(component.into_iter().map(|node| (node, index)));
        }
    }
    members
}
