use rustc_hash::{FxHashMap, FxHashSet};

use super::{Graph, Node, NodeId, OperatorNode, RunError};

/// Return the first element in `xs` which is a duplicate of an earlier element.
fn first_duplicate<T: PartialEq>(xs: &[T]) -> Option<&T> {
    for (i, x) in xs.iter().enumerate() {
        if xs[i + 1..].contains(x) {
            return Some(x);
        }
    }
    None
}

/// Planner creates execution plans for graph runs.
///
/// An execution plan is a sequence of operator nodes to evaluate in order to
/// produce values for a set of output nodes, given values for a set of input
/// nodes.
pub struct Planner<'a> {
    graph: &'a Graph,
}

impl<'a> Planner<'a> {
    pub fn with_graph(graph: &'a Graph) -> Self {
        Planner { graph }
    }

    /// Create an execution plan for a sequence of computation steps that begin
    /// with `inputs` and eventually produce `outputs`.
    ///
    /// The input and output IDs must be unique value or constant nodes.
    /// Outputs which are graph inputs or constants need no operators and do
    /// not appear in the plan.
    pub fn create_plan(
        &self,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<Vec<NodeId>, RunError> {
        if let Some(dupe_id) = first_duplicate(outputs) {
            return Err(RunError::planning_error(format!(
                "Outputs are not unique. Output \"{}\" is duplicated.",
                self.graph.node_name(*dupe_id)
            )));
        }
        for (output_index, output_id) in outputs.iter().enumerate() {
            match self.graph.get_node(*output_id) {
                Some(Node::Value(_) | Node::Constant(_)) => {}
                _ => {
                    return Err(RunError::planning_error(format!(
                        "Output {} (\"{}\") is not a value node in the graph.",
                        output_index,
                        self.graph.node_name(*output_id)
                    )));
                }
            }
        }

        if let Some(dupe_id) = first_duplicate(inputs) {
            return Err(RunError::planning_error(format!(
                "Inputs are not unique. Input \"{}\" is duplicated.",
                self.graph.node_name(*dupe_id)
            )));
        }
        for (input_index, input_id) in inputs.iter().enumerate() {
            match self.graph.get_node(*input_id) {
                Some(Node::Value(_) | Node::Constant(_)) => {}
                _ => {
                    return Err(RunError::planning_error(format!(
                        "Input {} (\"{}\") is not a value node in the graph.",
                        input_index,
                        self.graph.node_name(*input_id)
                    )));
                }
            }
        }

        // Build an execution plan via a depth first traversal of the graph
        // starting at the output nodes. A helper struct is used as recursive
        // closures are not supported in Rust.
        struct PlanBuilder<'a> {
            graph: &'a Graph,
            resolved_values: FxHashSet<NodeId>,
            /// Operators whose dependencies are currently being visited.
            visiting: FxHashSet<NodeId>,
            plan: Vec<(NodeId, &'a OperatorNode)>,
        }

        impl<'a> PlanBuilder<'a> {
            /// Add all the transitive dependencies of `op_node` to the plan,
            /// followed by `op_node`.
            fn visit(
                &mut self,
                op_node_id: NodeId,
                op_node: &'a OperatorNode,
            ) -> Result<(), RunError> {
                if !self.visiting.insert(op_node_id) {
                    return Err(RunError::planning_error(format!(
                        "Graph contains a cycle through \"{}\"",
                        self.graph.node_name(op_node_id)
                    )));
                }
                for &input in op_node.input_ids() {
                    if self.resolved_values.contains(&input) {
                        continue;
                    }
                    if let Some((input_op_id, input_op_node)) = self.graph.get_source_node(input) {
                        self.visit(input_op_id, input_op_node)?;
                    } else {
                        let msg = format!(
                            "Missing input \"{}\" for op \"{}\"",
                            self.graph.node_name(input),
                            self.graph.node_name(op_node_id)
                        );
                        return Err(RunError::planning_error(msg));
                    }
                }
                self.visiting.remove(&op_node_id);
                self.resolved_values
                    .extend(op_node.output_ids().iter().copied());
                self.plan.push((op_node_id, op_node));
                Ok(())
            }

            /// Take the current execution plan and re-order it so that
            /// operators which can run in place are more likely to find
            /// their inputs free to reuse.
            fn sort_plan(self, mut resolved_values: FxHashSet<NodeId>) -> Vec<NodeId> {
                // Map of value node to operators that depend on the value.
                let mut dependent_ops: FxHashMap<NodeId, Vec<(NodeId, &OperatorNode)>> =
                    FxHashMap::default();
                for (op_node_id, op_node) in &self.plan {
                    for &input_id in op_node.input_ids() {
                        dependent_ops
                            .entry(input_id)
                            .or_default()
                            .push((*op_node_id, op_node));
                    }
                }

                let mut output_plan = Vec::with_capacity(self.plan.len());

                // Initialize frontier with all operators that can be executed
                // from initially-available values.
                let mut frontier: Vec<(NodeId, &OperatorNode)> = self
                    .plan
                    .iter()
                    .filter(|(_, op_node)| {
                        op_node
                            .input_ids()
                            .iter()
                            .all(|id| resolved_values.contains(id))
                    })
                    .map(|(id, op_node)| (*id, *op_node))
                    .collect();

                while !frontier.is_empty() {
                    // Run non-in-place operators first, so that in-place
                    // operators are more likely to be the last consumers of
                    // their inputs.
                    let op_pos = frontier
                        .iter()
                        .position(|(_id, op)| !op.operator().can_run_in_place())
                        .unwrap_or(0);
                    let (next_op_id, op_node) = frontier.remove(op_pos);
                    output_plan.push(next_op_id);
                    resolved_values.extend(op_node.output_ids().iter().copied());

                    // Add operators that depend on the current op's outputs
                    // to the frontier once all their inputs are resolved.
                    for output_id in op_node.output_ids() {
                        let Some(deps) = dependent_ops.get(output_id) else {
                            continue;
                        };
                        for (candidate_op_id, candidate_op) in deps {
                            if frontier.iter().any(|(op_id, _)| op_id == candidate_op_id)
                                || output_plan.contains(candidate_op_id)
                            {
                                continue;
                            }
                            if candidate_op
                                .input_ids()
                                .iter()
                                .all(|id| resolved_values.contains(id))
                            {
                                frontier.push((*candidate_op_id, candidate_op));
                            }
                        }
                    }
                }

                output_plan
            }

            fn plan(mut self, outputs: &[NodeId]) -> Result<Vec<NodeId>, RunError> {
                let initial_resolved_values = self.resolved_values.clone();

                for output_id in outputs.iter() {
                    if self.resolved_values.contains(output_id) {
                        // Value is either an input or constant, or is
                        // produced by an operator that is already planned.
                        continue;
                    }

                    if let Some((op_node_id, op_node)) = self.graph.get_source_node(*output_id) {
                        self.visit(op_node_id, op_node)?;
                    } else {
                        let msg = format!(
                            "Source node not found for output \"{}\"",
                            self.graph.node_name(*output_id)
                        );
                        return Err(RunError::planning_error(msg));
                    }
                }

                if self.plan.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(self.sort_plan(initial_resolved_values))
            }
        }

        let resolved_values: FxHashSet<NodeId> = inputs
            .iter()
            .copied()
            .chain(self.graph.iter().filter_map(|(node_id, node)| {
                matches!(node, Node::Constant(_)).then_some(node_id)
            }))
            .collect();

        let builder = PlanBuilder {
            graph: self.graph,
            resolved_values,
            visiting: FxHashSet::default(),
            plan: Vec::new(),
        };
        builder.plan(outputs)
    }
}
