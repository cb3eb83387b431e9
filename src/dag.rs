//! Signal dependency graph
//!
//! Builds one node per signal mapping, wires dependency edges, validates
//! references, and produces a stable topological processing order via
//! Kahn's algorithm. Nodes live in an owned arena; edges are stored as
//! arena indices, so there are no cyclic owning references.
//!
//! The runtime scalars on each node (`has_new_data`, output/process
//! timestamps) are mutated only by the evaluator.

use crate::error::{Result, VssDagError};
use crate::mapping::SignalMapping;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info};

/// Handle into the DAG's node arena.
pub type NodeIndex = usize;

/// One signal in the DAG, wrapping its mapping plus runtime state.
#[derive(Debug)]
pub struct SignalNode {
    pub name: String,
    pub mapping: SignalMapping,
    /// True for signals fed from an external source, false for derived
    pub is_input: bool,
    /// Nodes that depend on this one
    pub dependents: Vec<NodeIndex>,
    pub in_degree: usize,

    // Runtime state, owned by the evaluator
    pub has_new_data: bool,
    pub last_update: Option<Instant>,
    pub last_output: Option<Instant>,
    /// Canonical text of the last emitted value, for change detection
    pub last_output_value: String,
    pub last_process: Option<Instant>,
    pub needs_periodic_update: bool,
}

impl SignalNode {
    fn new(name: String, mapping: SignalMapping) -> Self {
        let is_input = mapping.is_input();
        Self {
            name,
            mapping,
            is_input,
            dependents: Vec::new(),
            in_degree: 0,
            has_new_data: false,
            last_update: None,
            last_output: None,
            last_output_value: String::new(),
            last_process: None,
            needs_periodic_update: false,
        }
    }
}

/// The dependency graph over all signal mappings.
///
/// Immutable after [`SignalDag::build`] except for per-node runtime state.
#[derive(Debug, Default)]
pub struct SignalDag {
    nodes: Vec<SignalNode>,
    index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl SignalDag {
    /// Build the DAG from mappings in document order.
    ///
    /// Fails on duplicate names, mixed input/derived declarations, unknown
    /// dependencies, and cycles.
    pub fn build(mappings: Vec<(String, SignalMapping)>) -> Result<Self> {
        let mut dag = SignalDag::default();

        // Pass 1: instantiate nodes
        for (name, mapping) in mappings {
            if dag.index.contains_key(&name) {
                return Err(VssDagError::Config(format!(
                    "duplicate mapping for signal '{}'",
                    name
                )));
            }
            if mapping.is_input() && !mapping.depends_on.is_empty() {
                return Err(VssDagError::Config(format!(
                    "signal '{}' declares both a source and depends_on; \
                     a signal is either an input or derived",
                    name
                )));
            }
            if !mapping.is_input() && mapping.depends_on.is_empty() {
                return Err(VssDagError::Config(format!(
                    "signal '{}' has neither a source nor depends_on",
                    name
                )));
            }
            let idx = dag.nodes.len();
            dag.index.insert(name.clone(), idx);
            dag.nodes.push(SignalNode::new(name, mapping));
        }

        // Pass 2: wire dependency edges
        for idx in 0..dag.nodes.len() {
            let deps = dag.nodes[idx].mapping.depends_on.clone();
            for dep in &deps {
                let Some(&dep_idx) = dag.index.get(dep) else {
                    return Err(VssDagError::Config(format!(
                        "signal '{}' depends on '{}' which no mapping provides",
                        dag.nodes[idx].name, dep
                    )));
                };
                dag.nodes[dep_idx].dependents.push(idx);
                dag.nodes[idx].in_degree += 1;
            }
        }

        // Pass 3: topological order
        dag.order = dag.topological_sort()?;

        info!(nodes = dag.nodes.len(), "built signal DAG");
        for &idx in &dag.order {
            let node = &dag.nodes[idx];
            if node.mapping.depends_on.is_empty() {
                debug!("  {}", node.name);
            } else {
                debug!("  {} <- {:?}", node.name, node.mapping.depends_on);
            }
        }

        Ok(dag)
    }

    /// Kahn's algorithm. Ties among zero-in-degree nodes break on arena
    /// (document) order, making the result stable across runs.
    fn topological_sort(&self) -> Result<Vec<NodeIndex>> {
        let mut in_degrees: Vec<usize> = self.nodes.iter().map(|n| n.in_degree).collect();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for (idx, degree) in in_degrees.iter().enumerate() {
            if *degree == 0 {
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &dependent in &self.nodes[idx].dependents {
                in_degrees[dependent] -= 1;
                if in_degrees[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(VssDagError::Config(
                "dependency cycle detected in signal mappings".to_string(),
            ));
        }

        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topologically sorted node indices.
    pub fn processing_order(&self) -> &[NodeIndex] {
        &self.order
    }

    pub fn node(&self, idx: NodeIndex) -> &SignalNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut SignalNode {
        &mut self.nodes[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&SignalNode> {
        self.index_of(name).map(|idx| &self.nodes[idx])
    }

    /// Names of all input signals, in document order.
    pub fn input_signals(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_input)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Set the dirty bit on a node and propagate it transitively through
    /// its dependents. Idempotent: propagation stops at already-dirty
    /// nodes.
    pub fn mark_dirty(&mut self, name: &str) {
        let Some(idx) = self.index_of(name) else {
            return;
        };
        self.nodes[idx].has_new_data = true;
        let mut stack: Vec<NodeIndex> = self.nodes[idx].dependents.clone();
        while let Some(next) = stack.pop() {
            if !self.nodes[next].has_new_data {
                self.nodes[next].has_new_data = true;
                stack.extend(self.nodes[next].dependents.iter().copied());
            }
        }
    }
}
