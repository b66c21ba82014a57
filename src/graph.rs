use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

pub mod builder;
mod node;
mod node_id;
mod planner;
mod run_error;

#[cfg(test)]
mod tests;

pub use node::{ConstantNode, Dimension, Node, OperatorNode, ValueNode};
pub use node_id::NodeId;
pub use planner::Planner;
pub use run_error::{RunError, RunErrorKind};

use crate::operator::Operator;
use crate::value::{DataType, Value};

/// A dataflow graph of operators and the values they consume and produce.
///
/// Graphs contain three kinds of node:
///
/// - Value nodes, for graph inputs and the outputs of operators
/// - Constant nodes, for tensors known when the graph is built
/// - Operator nodes, which compute output values from input values
///
/// Each value is produced by at most one operator. Node IDs remain valid
/// until the node is removed, and are not reused.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,

    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,

    /// Map of value node ID to the operator that produces it.
    source_ids: FxHashMap<NodeId, NodeId>,

    /// Map of value node ID to the operators that consume it, in insertion
    /// order. An operator appears once for each input slot using the value.
    consumer_ids: FxHashMap<NodeId, Vec<NodeId>>,

    /// Map of node name to ID. When several nodes share a name, the most
    /// recently added wins.
    names: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_u32(self.nodes.len() as u32);
        if let Some(name) = node.name() {
            self.names.insert(name.to_string(), id);
        }
        self.nodes.push(Some(node));
        id
    }

    /// Add an operator node to the graph.
    ///
    /// `inputs` and `outputs` are IDs of value or constant nodes. Returns the
    /// ID of the operator node.
    pub fn add_op(
        &mut self,
        name: Option<&str>,
        op: Arc<dyn Operator + Send + Sync>,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> NodeId {
        let op_id = self.add_node(Node::Operator(OperatorNode::new(name, inputs, outputs, op)));
        for &output_id in outputs {
            self.source_ids.insert(output_id, op_id);
        }
        for &input_id in inputs {
            self.consumer_ids.entry(input_id).or_default().push(op_id);
        }
        op_id
    }

    /// Add an operator and its output value nodes to the graph.
    ///
    /// Output values are named after the operator. Returns the ID of the
    /// first output value.
    pub fn add_simple_op(
        &mut self,
        name: &str,
        op: Arc<dyn Operator + Send + Sync>,
        inputs: &[NodeId],
    ) -> NodeId {
        let num_outputs = op.num_outputs().max(1);
        let outputs: Vec<NodeId> = (0..num_outputs)
            .map(|i| {
                let output_name = if i == 0 {
                    format!("{}_out", name)
                } else {
                    format!("{}_out_{}", name, i)
                };
                self.add_value(Some(&output_name), None, None)
            })
            .collect();
        self.add_op(Some(name), op, inputs, &outputs);
        outputs[0]
    }

    /// Add a constant node to the graph.
    pub fn add_constant<V: Into<Value>>(&mut self, name: Option<&str>, value: V) -> NodeId {
        self.add_node(Node::Constant(ConstantNode::new(name, value.into())))
    }

    /// Add a value node to the graph.
    ///
    /// `shape` and `dtype` are the expected shape and type of the value, if
    /// known.
    pub fn add_value(
        &mut self,
        name: Option<&str>,
        shape: Option<Vec<Dimension>>,
        dtype: Option<DataType>,
    ) -> NodeId {
        self.add_node(Node::Value(ValueNode::new(name, shape, dtype)))
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize()).and_then(|n| n.as_ref())
    }

    pub(crate) fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.as_usize()).and_then(|n| n.as_mut())
    }

    /// Look up a node by name.
    pub fn get_node_id(&self, name: &str) -> Option<NodeId> {
        self.names
            .get(name)
            .copied()
            .filter(|id| self.get_node(*id).is_some())
    }

    /// Return the debug name for a node, or a name derived from its ID if it
    /// has none.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get_node(id)
            .and_then(|node| node.name())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Iterate over all nodes and their IDs, in order of insertion.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| Some((NodeId::from_u32(i as u32), node.as_ref()?)))
    }

    /// Iterate over operator nodes and their IDs.
    pub fn iter_operators(&self) -> impl Iterator<Item = (NodeId, &OperatorNode)> {
        self.iter().filter_map(|(id, node)| match node {
            Node::Operator(op) => Some((id, op)),
            _ => None,
        })
    }

    /// Return the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Return the number of operator nodes in the graph.
    pub fn operator_count(&self) -> usize {
        self.iter_operators().count()
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.input_ids
    }

    pub fn set_input_ids(&mut self, ids: &[NodeId]) {
        self.input_ids = ids.to_vec();
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.output_ids
    }

    pub fn set_output_ids(&mut self, ids: &[NodeId]) {
        self.output_ids = ids.to_vec();
    }

    /// Return the operator node which produces a given value node.
    pub fn get_source_node(&self, value: NodeId) -> Option<(NodeId, &OperatorNode)> {
        let op_id = *self.source_ids.get(&value)?;
        match self.get_node(op_id) {
            Some(Node::Operator(op)) => Some((op_id, op)),
            _ => None,
        }
    }

    /// Return the IDs of operators which use a value as an input.
    ///
    /// An operator which uses the value for several inputs appears once for
    /// each use.
    pub fn get_consumers(&self, value: NodeId) -> &[NodeId] {
        self.consumer_ids
            .get(&value)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Remove nodes from the graph.
    ///
    /// Operator edges are removed along with operators. IDs of other nodes
    /// are unaffected. The graph's input and output lists are not modified.
    pub fn remove_nodes(&mut self, ids: &[NodeId]) {
        let removed: FxHashSet<NodeId> = ids.iter().copied().collect();
        for &id in ids {
            let Some(node) = self.nodes.get_mut(id.as_usize()).and_then(|n| n.take()) else {
                continue;
            };
            if let Some(name) = node.name() {
                if self.names.get(name) == Some(&id) {
                    self.names.remove(name);
                }
            }
            match node {
                Node::Operator(op) => {
                    for output in op.output_ids() {
                        if self.source_ids.get(output) == Some(&id) {
                            self.source_ids.remove(output);
                        }
                    }
                }
                Node::Value(_) | Node::Constant(_) => {
                    self.source_ids.remove(&id);
                    self.consumer_ids.remove(&id);
                }
            }
        }
        for consumers in self.consumer_ids.values_mut() {
            consumers.retain(|op_id| !removed.contains(op_id));
        }
        self.consumer_ids.retain(|_, consumers| !consumers.is_empty());
    }

    /// Replace uses of `old_value` with `new_value` in operator inputs and
    /// graph outputs.
    pub(crate) fn replace_value(&mut self, old_value: NodeId, new_value: NodeId) {
        if old_value == new_value {
            return;
        }
        for output_id in self.output_ids.iter_mut().filter(|id| **id == old_value) {
            *output_id = new_value;
        }

        let Some(consumers) = self.consumer_ids.remove(&old_value) else {
            return;
        };
        let mut unique_consumers = consumers.clone();
        unique_consumers.dedup();
        for &op_id in &unique_consumers {
            if let Some(Node::Operator(op_node)) = self.get_node_mut(op_id) {
                op_node.replace_input(old_value, new_value);
            }
        }
        self.consumer_ids
            .entry(new_value)
            .or_default()
            .extend(consumers);
    }

    /// Replace the operator of an operator node, keeping its inputs and
    /// outputs.
    pub(crate) fn replace_operator(
        &mut self,
        op_id: NodeId,
        op: Arc<dyn Operator + Send + Sync>,
    ) -> bool {
        match self.get_node_mut(op_id) {
            Some(Node::Operator(op_node)) => {
                op_node.set_operator(op);
                true
            }
            _ => false,
        }
    }

    /// Replace all the inputs of an operator node.
    pub(crate) fn replace_op_inputs(&mut self, op_id: NodeId, inputs: &[NodeId]) -> bool {
        let old_inputs = match self.get_node_mut(op_id) {
            Some(Node::Operator(op_node)) => {
                let old_inputs = op_node.input_ids().to_vec();
                op_node.set_input_ids(inputs);
                old_inputs
            }
            _ => return false,
        };
        for old_input in old_inputs {
            if let Some(consumers) = self.consumer_ids.get_mut(&old_input) {
                if let Some(pos) = consumers.iter().position(|id| *id == op_id) {
                    consumers.remove(pos);
                }
                if consumers.is_empty() {
                    self.consumer_ids.remove(&old_input);
                }
            }
        }
        for &input in inputs {
            self.consumer_ids.entry(input).or_default().push(op_id);
        }
        true
    }

    /// Compute a plan of operator IDs to run to produce `outputs` from
    /// `inputs`.
    pub fn execution_plan(
        &self,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<Vec<NodeId>, RunError> {
        Planner::with_graph(self).create_plan(inputs, outputs)
    }

    /// Return all operator nodes in an order where each operator follows
    /// the operators producing its inputs.
    ///
    /// Returns a planning error if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, RunError> {
        let mut pending_inputs: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut ready = Vec::new();
        for (op_id, op_node) in self.iter_operators() {
            let n_pending = op_node
                .input_ids()
                .iter()
                .filter(|id| self.get_source_node(**id).is_some())
                .count();
            if n_pending == 0 {
                ready.push(op_id);
            } else {
                pending_inputs.insert(op_id, n_pending);
            }
        }
        // Process operators lowest ID first, for a stable order.
        ready.reverse();

        let mut order = Vec::with_capacity(self.operator_count());
        while let Some(op_id) = ready.pop() {
            order.push(op_id);
            let Some(Node::Operator(op_node)) = self.get_node(op_id) else {
                continue;
            };
            let mut newly_ready = Vec::new();
            for output in op_node.output_ids() {
                for consumer in self.get_consumers(*output) {
                    if let Some(count) = pending_inputs.get_mut(consumer) {
                        *count -= 1;
                        if *count == 0 {
                            pending_inputs.remove(consumer);
                            newly_ready.push(*consumer);
                        }
                    }
                }
            }
            newly_ready.sort();
            ready.extend(newly_ready.into_iter().rev());
        }

        if let Some(op_id) = pending_inputs.keys().min() {
            return Err(RunError::planning_error(format!(
                "Graph contains a cycle through \"{}\"",
                self.node_name(*op_id)
            )));
        }
        Ok(order)
    }

    /// Check the structural invariants of the graph.
    ///
    /// These are that operator edges refer to value or constant nodes, that
    /// each value has at most one producer, that inputs are values without a
    /// producer, that outputs exist and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), RunError> {
        let mut producers: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for (op_id, op_node) in self.iter_operators() {
            for &input in op_node.input_ids() {
                if !matches!(
                    self.get_node(input),
                    Some(Node::Value(_) | Node::Constant(_))
                ) {
                    return Err(RunError::planning_error(format!(
                        "Input \"{}\" of operator \"{}\" is not a value",
                        self.node_name(input),
                        self.node_name(op_id)
                    )));
                }
            }
            for &output in op_node.output_ids() {
                if !matches!(self.get_node(output), Some(Node::Value(_))) {
                    return Err(RunError::planning_error(format!(
                        "Output \"{}\" of operator \"{}\" is not a value",
                        self.node_name(output),
                        self.node_name(op_id)
                    )));
                }
                if let Some(other_op) = producers.insert(output, op_id) {
                    return Err(RunError::planning_error(format!(
                        "Value \"{}\" is produced by both \"{}\" and \"{}\"",
                        self.node_name(output),
                        self.node_name(other_op),
                        self.node_name(op_id)
                    )));
                }
            }
        }

        for &input in &self.input_ids {
            if !matches!(self.get_node(input), Some(Node::Value(_))) || producers.contains_key(&input)
            {
                return Err(RunError::planning_error(format!(
                    "Graph input \"{}\" is not a value without a producer",
                    self.node_name(input)
                )));
            }
        }
        for &output in &self.output_ids {
            if !matches!(
                self.get_node(output),
                Some(Node::Value(_) | Node::Constant(_))
            ) {
                return Err(RunError::planning_error(format!(
                    "Graph output \"{}\" is not a value",
                    self.node_name(output)
                )));
            }
        }

        self.topological_order().map(|_| ())
    }
}
