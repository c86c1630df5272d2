//! Turns the values resolved for top-level requirements into graph nodes,
//! sharing one node between every value of the same function application.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use petgraph::Graph;
use petgraph::visit::EdgeRef;
use tracing::{debug, info, warn};

use crate::engine::{GraphBuildingContext, ResolutionPump, ResolvedValueCallback};
use crate::error::ResolutionError;
use crate::failure::{ResolutionFailure, ResolutionFailureListener};
use crate::function::{MarketDataSourcingFunction, ParameterizedFunction};
use crate::graph::{DependencyGraph, DependencyNode};
use crate::value::{ResolvedValue, TargetSpecification, ValueRequirement, ValueSpecification};

type NodeId = usize;
type Buffer = Mutex<HashMap<ValueSpecification, Arc<ResolvedValue>>>;

struct AssemblyNode {
    function: ParameterizedFunction,
    target: TargetSpecification,
    /// Consumed specification and the node producing it.
    inputs: BTreeMap<ValueSpecification, NodeId>,
    outputs: BTreeSet<ValueSpecification>,
}

/// The graph under construction. Nodes are never removed, only widened.
#[derive(Default)]
struct Assembly {
    nodes: Vec<AssemblyNode>,
    producers: HashMap<ValueSpecification, NodeId>,
    usage: HashMap<ValueSpecification, BTreeSet<NodeId>>,
    by_function: HashMap<(ParameterizedFunction, TargetSpecification), Vec<NodeId>>,
    terminal: BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>>,
}

impl Assembly {
    /// Finds or creates the node producing `value`, along with the nodes for
    /// everything it consumes. `downstream` holds the specifications already
    /// being placed further down this chain.
    fn node_for(
        &mut self,
        buffer: &Buffer,
        value: &ResolvedValue,
        downstream: &HashSet<ValueSpecification>,
    ) -> Option<NodeId> {
        let spec = value.specification();
        if downstream.contains(spec) {
            debug!(%spec, "already being placed further down");
            return None;
        }
        if let Some(&id) = self.producers.get(spec) {
            return Some(id);
        }

        let mut inputs = BTreeMap::new();
        let mut deeper: Option<HashSet<ValueSpecification>> = None;
        for input in value.inputs() {
            if let Some(&id) = self.producers.get(input) {
                inputs.insert(input.clone(), id);
                continue;
            }
            let Some(input_value) = buffer.lock().unwrap().get(input).cloned() else {
                warn!(%input, consumer = %spec, "no production registered for input");
                return None;
            };
            let deeper = deeper.get_or_insert_with(|| {
                let mut specs = downstream.clone();
                specs.insert(spec.clone());
                specs
            });
            let Some(id) = self.node_for(buffer, &input_value, deeper) else {
                warn!(%input, consumer = %spec, "no node for input");
                return None;
            };
            inputs.insert(self.reduce(id, input), id);
        }

        // Placing the inputs may have placed this value as a side output.
        if let Some(&id) = self.producers.get(spec) {
            return Some(id);
        }

        let key = (value.function().clone(), spec.target().clone());
        let id = match self.find_existing(&key, value, &inputs) {
            Some(id) => {
                self.add_inputs(id, inputs);
                id
            }
            None => self.create(key, value, inputs),
        };
        if self.producers.contains_key(spec) {
            buffer.lock().unwrap().remove(spec);
        }
        Some(id)
    }

    /// The output of `id` standing in for `wanted`.
    fn reduce(&self, id: NodeId, wanted: &ValueSpecification) -> ValueSpecification {
        self.output_for(id, wanted).unwrap_or_else(|| wanted.clone())
    }

    fn output_for(&self, id: NodeId, wanted: &ValueSpecification) -> Option<ValueSpecification> {
        let outputs = &self.nodes[id].outputs;
        if outputs.contains(wanted) {
            return Some(wanted.clone());
        }
        outputs
            .iter()
            .find(|output| {
                output.name() == wanted.name()
                    && (wanted.properties().is_satisfied_by(output.properties())
                        || output.properties().is_satisfied_by(wanted.properties()))
            })
            .cloned()
    }

    fn find_existing(
        &mut self,
        key: &(ParameterizedFunction, TargetSpecification),
        value: &ResolvedValue,
        inputs: &BTreeMap<ValueSpecification, NodeId>,
    ) -> Option<NodeId> {
        // Every market data leaf stays its own node.
        if value.function().id() == MarketDataSourcingFunction::ID {
            return None;
        }
        let candidates = self.by_function.get(key)?.clone();
        for id in candidates {
            if mismatch_union(&self.nodes[id].outputs, value.outputs()) {
                continue;
            }
            if inputs.values().any(|&input| self.is_upstream(id, input)) {
                debug!(node = id, "reuse would close a cycle");
                continue;
            }
            self.widen_outputs(id, value);
            return Some(id);
        }
        None
    }

    /// Whether `id` is `from` or feeds it, directly or not.
    fn is_upstream(&self, id: NodeId, from: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == id {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.nodes[node].inputs.values().copied());
            }
        }
        false
    }

    /// Merges the outputs of `value` into node `id`. Wildcard outputs narrowed
    /// by the new value are replaced, consumers included.
    fn widen_outputs(&mut self, id: NodeId, value: &ResolvedValue) {
        let outputs = self.nodes[id].outputs.clone();
        let mut replacements: BTreeMap<ValueSpecification, ValueSpecification> = BTreeMap::new();
        let mut additional = Vec::new();

        'outputs: for output in value.outputs() {
            if outputs.contains(output) {
                continue;
            }
            for existing in outputs.iter().filter(|existing| existing.name() == output.name()) {
                if replacements.contains_key(existing) {
                    continue;
                }
                if existing.properties().is_satisfied_by(output.properties()) {
                    let composed = existing.properties().compose(output.properties());
                    if composed != *existing.properties() {
                        replacements.insert(existing.clone(), existing.with_properties(composed));
                    }
                    continue 'outputs;
                }
            }
            if self.producers.contains_key(output) {
                debug!(%output, node = id, "output already produced elsewhere");
            } else {
                additional.push(output.clone());
            }
        }
        if additional.is_empty() && replacements.is_empty() {
            return;
        }

        let mut widened: BTreeSet<ValueSpecification> = additional.into_iter().collect();
        for original in outputs {
            match replacements.get(&original) {
                Some(replacement) => {
                    self.producers.remove(&original);
                    if !self.producers.contains_key(replacement) {
                        widened.insert(replacement.clone());
                    }
                }
                None => {
                    widened.insert(original);
                }
            }
        }
        for output in &widened {
            self.producers.insert(output.clone(), id);
        }
        self.nodes[id].outputs = widened;

        for (original, replacement) in replacements {
            debug!(%original, %replacement, "narrowing output");
            let producer = self.producers.get(&replacement).copied().unwrap_or(id);
            if let Some(consumers) = self.usage.remove(&original) {
                for &consumer in &consumers {
                    let node = &mut self.nodes[consumer];
                    if node.inputs.remove(&original).is_some() {
                        node.inputs.insert(replacement.clone(), producer);
                    }
                }
                self.usage.entry(replacement.clone()).or_default().extend(consumers);
            }
            if let Some(requirements) = self.terminal.remove(&original) {
                self.terminal.entry(replacement).or_default().extend(requirements);
            }
        }
    }

    fn add_inputs(&mut self, id: NodeId, inputs: BTreeMap<ValueSpecification, NodeId>) {
        for (input, producer) in inputs {
            if let std::collections::btree_map::Entry::Vacant(entry) = self.nodes[id].inputs.entry(input.clone()) {
                entry.insert(producer);
                self.usage.entry(input).or_default().insert(id);
            }
        }
    }

    fn create(
        &mut self,
        key: (ParameterizedFunction, TargetSpecification),
        value: &ResolvedValue,
        inputs: BTreeMap<ValueSpecification, NodeId>,
    ) -> NodeId {
        let id = self.nodes.len();
        let outputs: BTreeSet<ValueSpecification> = value
            .outputs()
            .iter()
            .filter(|output| !self.producers.contains_key(*output))
            .cloned()
            .collect();
        for output in &outputs {
            self.producers.insert(output.clone(), id);
        }
        for input in inputs.keys() {
            self.usage.entry(input.clone()).or_default().insert(id);
        }
        self.nodes.push(AssemblyNode {
            function: key.0.clone(),
            target: key.1.clone(),
            inputs,
            outputs,
        });
        self.by_function.entry(key).or_default().push(id);
        id
    }

    fn add_terminal(
        &mut self,
        buffer: &Buffer,
        requirement: &ValueRequirement,
        value: &ResolvedValue,
    ) -> Option<ValueSpecification> {
        let id = self.node_for(buffer, value, &HashSet::new())?;
        let output = self.output_for(id, value.specification())?;
        self.terminal
            .entry(output.clone())
            .or_default()
            .insert(requirement.clone());
        Some(output)
    }

    /// A placed value, provided something consumes it.
    fn production(&self, spec: &ValueSpecification) -> Option<Arc<ResolvedValue>> {
        let &id = self.producers.get(spec)?;
        if !self.usage.contains_key(spec) && !self.terminal.contains_key(spec) {
            return None;
        }
        let node = &self.nodes[id];
        Some(Arc::new(ResolvedValue::new(
            spec.clone(),
            node.function.clone(),
            node.inputs.keys().cloned().collect(),
            node.outputs.clone(),
        )))
    }

    fn seed(&mut self, graph: &DependencyGraph) {
        let petgraph = graph.graph();
        let mut ids = HashMap::new();
        for index in petgraph.node_indices() {
            let node = &petgraph[index];
            let id = self.nodes.len();
            for output in &node.outputs {
                self.producers.insert(output.clone(), id);
            }
            self.nodes.push(AssemblyNode {
                function: node.function.clone(),
                target: node.target.clone(),
                inputs: BTreeMap::new(),
                outputs: node.outputs.clone(),
            });
            self.by_function
                .entry((node.function.clone(), node.target.clone()))
                .or_default()
                .push(id);
            ids.insert(index, id);
        }
        for edge in petgraph.edge_references() {
            let producer = ids[&edge.source()];
            let consumer = ids[&edge.target()];
            self.nodes[consumer].inputs.insert(edge.weight().clone(), producer);
            self.usage.entry(edge.weight().clone()).or_default().insert(consumer);
        }
        for (spec, requirements) in graph.terminal_outputs() {
            self.terminal
                .entry(spec.clone())
                .or_default()
                .extend(requirements.iter().cloned());
        }
    }

    fn to_graph(&self, calculation_configuration: &str) -> DependencyGraph {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if node.outputs.is_empty() {
                continue;
            }
            let index = graph.add_node(DependencyNode {
                function: node.function.clone(),
                target: node.target.clone(),
                inputs: node.inputs.keys().cloned().collect(),
                outputs: node.outputs.clone(),
            });
            indices.insert(id, index);
        }
        for (id, node) in self.nodes.iter().enumerate() {
            let Some(&consumer) = indices.get(&id) else {
                continue;
            };
            for (input, producer) in &node.inputs {
                if let Some(&producer) = indices.get(producer) {
                    graph.add_edge(producer, consumer, input.clone());
                }
            }
        }
        DependencyGraph::new(graph, self.terminal.clone(), calculation_configuration.to_string())
    }
}

/// Whether a same-named pair between the two output sets has properties
/// neither side can accept.
fn mismatch_union(a: &BTreeSet<ValueSpecification>, b: &BTreeSet<ValueSpecification>) -> bool {
    mismatch(a, b) || mismatch(b, a)
}

fn mismatch(a: &BTreeSet<ValueSpecification>, b: &BTreeSet<ValueSpecification>) -> bool {
    a.iter().filter(|spec| !b.contains(*spec)).any(|spec| {
        b.iter()
            .find(|other| other.name() == spec.name())
            .is_some_and(|other| !spec.properties().is_satisfied_by(other.properties()))
    })
}

/// Subscribed to every top-level requirement. Results are queued and placed
/// into the graph by one thread at a time.
pub(crate) struct GetTerminalValuesCallback {
    queue: Mutex<VecDeque<(ValueRequirement, Arc<ResolvedValue>)>>,
    draining: AtomicBool,
    assembly: RwLock<Assembly>,
    /// Values declared by function applications, not yet placed.
    buffer: Buffer,
    unsatisfied: Mutex<Vec<(ValueRequirement, Option<Arc<ResolutionFailure>>)>>,
    listener: RwLock<Option<Arc<dyn ResolutionFailureListener>>>,
}

impl GetTerminalValuesCallback {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            assembly: RwLock::new(Assembly::default()),
            buffer: Mutex::new(HashMap::new()),
            unsatisfied: Mutex::new(Vec::new()),
            listener: RwLock::new(None),
        }
    }

    pub(crate) fn set_failure_listener(&self, listener: Arc<dyn ResolutionFailureListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    pub(crate) fn declare_production(&self, value: Arc<ResolvedValue>) {
        self.buffer
            .lock()
            .unwrap()
            .insert(value.specification().clone(), value);
    }

    /// Drops unplaced values that can no longer reach the graph. A value
    /// stays while it is in `live` or feeds a value that stays, as do the
    /// inputs of anything still queued. Only sound while no step is running.
    /// Returns how many went.
    pub(crate) fn evict_unplaced(&self, live: impl IntoIterator<Item = ValueSpecification>) -> usize {
        let mut pending: Vec<ValueSpecification> = live.into_iter().collect();
        pending.extend(
            self.queue
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, value)| value.inputs().iter().cloned()),
        );
        let mut buffer = self.buffer.lock().unwrap();

        let mut keep = HashSet::new();
        while let Some(spec) = pending.pop() {
            if !keep.insert(spec.clone()) {
                continue;
            }
            if let Some(value) = buffer.get(&spec) {
                pending.extend(value.inputs().iter().cloned());
            }
        }
        let before = buffer.len();
        buffer.retain(|spec, _| keep.contains(spec));
        let evicted = before - buffer.len();
        if evicted > 0 {
            debug!(evicted, remaining = buffer.len(), "evicted unplaced productions");
        }
        evicted
    }

    pub(crate) fn get_production(&self, spec: &ValueSpecification) -> Option<Arc<ResolvedValue>> {
        let buffered = self.buffer.lock().unwrap().get(spec).cloned();
        buffered.or_else(|| self.assembly.read().unwrap().production(spec))
    }

    /// The value already in the graph for `requirement`.
    pub(crate) fn previous_resolution(&self, requirement: &ValueRequirement) -> Option<Arc<ResolvedValue>> {
        let assembly = self.assembly.read().unwrap();
        let (spec, _) = assembly
            .terminal
            .iter()
            .find(|(_, requirements)| requirements.contains(requirement))?;
        assembly.production(spec)
    }

    /// Starts from an earlier graph.
    pub(crate) fn populate(&self, graph: &DependencyGraph) {
        self.assembly.write().unwrap().seed(graph);
    }

    pub(crate) fn value_requirement_mapping(&self) -> BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        self.assembly.read().unwrap().terminal.clone()
    }

    pub(crate) fn unsatisfied(&self) -> Vec<ResolutionError> {
        self.unsatisfied
            .lock()
            .unwrap()
            .iter()
            .map(|(requirement, failure)| ResolutionError::Unsatisfiable {
                requirement: requirement.clone(),
                failure: failure.clone(),
            })
            .collect()
    }

    pub(crate) fn graph(&self, calculation_configuration: &str) -> DependencyGraph {
        self.assembly.read().unwrap().to_graph(calculation_configuration)
    }

    fn drain(&self) {
        while !self.queue.lock().unwrap().is_empty()
            && self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            {
                let mut assembly = self.assembly.write().unwrap();
                loop {
                    let next = self.queue.lock().unwrap().pop_front();
                    let Some((requirement, value)) = next else {
                        break;
                    };
                    match assembly.add_terminal(&self.buffer, &requirement, &value) {
                        Some(output) => debug!(%requirement, %output, "terminal value placed"),
                        None => warn!(%requirement, %value, "resolved but couldn't create graph nodes"),
                    }
                }
            }
            self.draining.store(false, Ordering::Release);
        }
    }
}

impl ResolvedValueCallback for GetTerminalValuesCallback {
    fn resolved(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    ) {
        debug!(%requirement, %value, "resolved top-level requirement");
        if let Some(pump) = pump {
            ctx.close(&pump);
        }
        ctx.state().pending.remove(requirement);
        self.queue
            .lock()
            .unwrap()
            .push_back((requirement.clone(), value));
        self.drain();
    }

    fn failed(
        &self,
        ctx: &mut GraphBuildingContext,
        requirement: &ValueRequirement,
        failure: Option<ResolutionFailure>,
    ) {
        info!(%requirement, "couldn't resolve");
        ctx.state().pending.remove(requirement);
        let failure = failure.map(Arc::new);
        match &failure {
            Some(failure) => {
                if let Some(listener) = self.listener.read().unwrap().as_ref() {
                    listener.notify_failure(failure);
                }
            }
            None => debug!(%requirement, "no failure state"),
        }
        ctx.state().record_exception(&ResolutionError::Unsatisfiable {
            requirement: requirement.clone(),
            failure: failure.clone(),
        });
        self.unsatisfied
            .lock()
            .unwrap()
            .push((requirement.clone(), failure));
    }

    fn recursion_detected(&self) {}
}
