//! Owned compute graph.
//!
//! A [`ComputeGraph`] is a DAG of single-output nodes stored in an arena indexed by
//! [`NodeId`]. Removed nodes leave a tombstone so ids stay stable while passes
//! mutate the graph. Each node output carries an element type, a partial shape and
//! a set of tensor names; each node has a friendly name.
//!
//! Passes mutate the graph in place and call [`ComputeGraph::validate`] afterwards,
//! which re-infers every output type and shape in topological order.

pub mod op;
pub mod shape;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;
use crate::tensor::{ElementType, Tensor};

pub use op::{Op, SLICE_TO_END};
pub use shape::{Dim, PartialShape};

pub type NodeId = usize;

/// Type, shape and names of a node output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub element_type: ElementType,
    pub shape: PartialShape,
    pub names: BTreeSet<String>,
}

impl TensorDesc {
    pub fn any_name(&self) -> Option<&str> {
        self.names.iter().next().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub output: TensorDesc,
}

impl Node {
    pub fn has_name(&self, name: &str) -> bool {
        self.name == name || self.output.names.contains(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeGraph {
    nodes: Vec<Option<Node>>,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
    rt_info: BTreeMap<String, String>,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    /// Add a graph input. Its tensor is named after the friendly name.
    pub fn add_parameter(&mut self, name: &str, element_type: ElementType, shape: PartialShape) -> NodeId {
        let id = self.push(Node {
            name: name.to_string(),
            op: Op::Parameter,
            inputs: Vec::new(),
            output: TensorDesc {
                element_type,
                shape,
                names: BTreeSet::from([name.to_string()]),
            },
        });
        self.parameters.push(id);
        id
    }

    /// Add a parameter node that is not yet listed as a graph input.
    pub fn add_detached_parameter(&mut self, node_name: &str, desc: TensorDesc) -> NodeId {
        self.push(Node {
            name: node_name.to_string(),
            op: Op::Parameter,
            inputs: Vec::new(),
            output: desc,
        })
    }

    pub fn add_constant(&mut self, name: &str, value: Tensor) -> NodeId {
        let output = TensorDesc {
            element_type: value.element_type(),
            shape: PartialShape::from_static(value.shape()),
            names: BTreeSet::new(),
        };
        self.push(Node {
            name: name.to_string(),
            op: Op::Constant(value),
            inputs: Vec::new(),
            output,
        })
    }

    /// Add an operation node, inferring its output from the inputs.
    pub fn add_op(&mut self, name: &str, op: Op, inputs: &[NodeId]) -> Result<NodeId, InferenceError> {
        let (element_type, shape) = self.infer(&op, inputs)?;
        Ok(self.push(Node {
            name: name.to_string(),
            op,
            inputs: inputs.to_vec(),
            output: TensorDesc {
                element_type,
                shape,
                names: BTreeSet::new(),
            },
        }))
    }

    /// Add a graph output reading `source`. The result is looked up by `name`.
    pub fn add_result(&mut self, name: &str, source: NodeId) -> Result<NodeId, InferenceError> {
        let id = self.add_op(name, Op::Result, &[source])?;
        self.node_mut(id).output.names.insert(name.to_string());
        self.results.push(id);
        Ok(id)
    }

    fn infer(&self, op: &Op, inputs: &[NodeId]) -> Result<(ElementType, PartialShape), InferenceError> {
        let mut descs = Vec::with_capacity(inputs.len());
        for &i in inputs {
            let node = self.try_node(i).ok_or_else(|| {
                InferenceError::Graph(format!("input {} of {} is not in the graph", i, op.type_name()))
            })?;
            let value = match &node.op {
                Op::Constant(t) => Some(t),
                _ => None,
            };
            descs.push((node.output.element_type, &node.output.shape, value));
        }
        op::infer_output(op, &descs)
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    /// # Panics
    /// Panics if `id` was removed.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id) {
            Some(Some(node)) => node,
            _ => panic!("node {} is not in the graph", id),
        }
    }

    /// # Panics
    /// Panics if `id` was removed.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(Some(node)) => node,
            _ => panic!("node {} is not in the graph", id),
        }
    }

    /// Ids of all live nodes in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| i))
    }

    pub fn node_count(&self) -> usize {
        self.node_ids().count()
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<NodeId> {
        self.parameters.iter().copied().find(|&p| self.node(p).has_name(name))
    }

    pub fn result_by_name(&self, name: &str) -> Option<NodeId> {
        self.results.iter().copied().find(|&r| self.node(r).has_name(name))
    }

    /// Nodes reading `id`, with the input slot they read it through.
    pub fn consumers(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut out = Vec::new();
        for n in self.node_ids() {
            for (slot, &input) in self.node(n).inputs.iter().enumerate() {
                if input == id {
                    out.push((n, slot));
                }
            }
        }
        out
    }

    /// Rewire every consumer of `old` to read `new` instead. `new` itself is left
    /// untouched so it can wrap `old`.
    pub fn replace_uses(&mut self, old: NodeId, new: NodeId) {
        for (consumer, slot) in self.consumers(old) {
            if consumer != new {
                self.node_mut(consumer).inputs[slot] = new;
            }
        }
    }

    pub fn set_input(&mut self, node: NodeId, slot: usize, source: NodeId) {
        self.node_mut(node).inputs[slot] = source;
    }

    /// Swap graph input `old` for `new` at the same position and rewire consumers.
    pub fn replace_parameter(&mut self, old: NodeId, new: NodeId) -> Result<(), InferenceError> {
        let pos = self
            .parameters
            .iter()
            .position(|&p| p == old)
            .ok_or_else(|| InferenceError::Graph(format!("node {} is not a graph input", old)))?;
        self.replace_uses(old, new);
        self.parameters[pos] = new;
        self.nodes[old] = None;
        Ok(())
    }

    /// Remove a graph input. Any consumers are left dangling and fail validation.
    pub fn remove_parameter(&mut self, id: NodeId) {
        self.parameters.retain(|&p| p != id);
        if let Some(slot) = self.nodes.get_mut(id) {
            *slot = None;
        }
    }

    pub fn rt_info(&self, key: &str) -> Option<&str> {
        self.rt_info.get(key).map(String::as_str)
    }

    pub fn set_rt_info(&mut self, key: &str, value: &str) {
        self.rt_info.insert(key.to_string(), value.to_string());
    }

    /// Live nodes ordered so every node follows its inputs.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, InferenceError> {
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut users: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for id in self.node_ids() {
            for &input in &self.node(id).inputs {
                if self.try_node(input).is_none() {
                    return Err(InferenceError::Graph(format!(
                        "node '{}' reads removed node {}",
                        self.node(id).name,
                        input
                    )));
                }
                indegree[id] += 1;
                users[input].push(id);
            }
        }
        let mut queue: VecDeque<NodeId> = self.node_ids().filter(|&id| indegree[id] == 0).collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &user in &users[id] {
                indegree[user] -= 1;
                if indegree[user] == 0 {
                    queue.push_back(user);
                }
            }
        }
        if order.len() != self.node_count() {
            return Err(InferenceError::Graph("graph contains a cycle".to_string()));
        }
        Ok(order)
    }

    /// Re-infer every node output in topological order. Tensor names are kept.
    pub fn validate(&mut self) -> Result<(), InferenceError> {
        for id in self.topological_order()? {
            let node = self.node(id);
            if matches!(node.op, Op::Parameter | Op::Constant(_)) {
                continue;
            }
            let (element_type, shape) = self.infer(&node.op, &node.inputs).map_err(|e| {
                InferenceError::Graph(format!("validation of '{}' failed: {}", node.name, e))
            })?;
            let output = &mut self.node_mut(id).output;
            output.element_type = element_type;
            output.shape = shape;
        }
        Ok(())
    }

    /// Drop nodes that no result depends on. Graph inputs are always kept.
    pub fn prune(&mut self) -> usize {
        let mut live = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.results.clone();
        stack.extend_from_slice(&self.parameters);
        while let Some(id) = stack.pop() {
            if live[id] || self.try_node(id).is_none() {
                continue;
            }
            live[id] = true;
            stack.extend_from_slice(&self.node(id).inputs);
        }
        let mut removed = 0;
        for (id, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_some() && !live[id] {
                *slot = None;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned unreachable nodes");
        }
        removed
    }

    /// Assign new shapes to named graph inputs and re-infer the graph.
    ///
    /// Ranks must be preserved. Any shape conflict found while re-inferring is an
    /// error and leaves the graph unchanged.
    pub fn reshape(&mut self, shapes: &BTreeMap<String, PartialShape>) -> Result<(), InferenceError> {
        let mut candidate = self.clone();
        for (name, shape) in shapes {
            let id = candidate
                .parameter_by_name(name)
                .ok_or_else(|| InferenceError::TensorNotFound(name.clone()))?;
            let output = &mut candidate.node_mut(id).output;
            if output.shape.rank() != shape.rank() {
                return Err(InferenceError::Graph(format!(
                    "cannot reshape input '{}' from {} to {}",
                    name, output.shape, shape
                )));
            }
            output.shape = shape.clone();
        }
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Nodes matching a predicate, in insertion order.
    pub fn find_nodes(&self, mut pred: impl FnMut(&Node) -> bool) -> Vec<NodeId> {
        self.node_ids().filter(|&id| pred(self.node(id))).collect()
    }
}
