//! Graph rewriting.
//!
//! The optimizer applies [`RewriteRule`]s from a [`RuleDb`] to a graph. Rules
//! are selected by a [`Query`] over their tags and grouped into [`Phase`]s.
//! Within a phase the selected rules are applied to every operator, in
//! topological order, until no rule applies or an iteration limit is reached.
//!
//! Rewrites are values describing a change ([`Rewrite`]) and are checked
//! before being applied, so a rule cannot leave the graph in an invalid
//! state.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Graph, Node, NodeId, OperatorNode, RunError};
use crate::infer_shapes::{infer_shapes, InferOptions, ShapeError, ShapeMap};
use crate::operator::Operator;
use crate::value::{DataType, Value};

mod diagnostics;
mod pattern_matcher;
mod rules;

pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use pattern_matcher::{Match, Pattern};

/// Errors that occur while optimizing a graph.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizeError {
    /// The graph is invalid, eg. it contains a cycle.
    Graph(RunError),

    /// Shape inference for shape-dependent rewrites failed.
    Shape(ShapeError),
}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "optimization failed: {}", err),
            Self::Shape(err) => write!(f, "optimization failed: {}", err),
        }
    }
}

impl Error for OptimizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Graph(err) => Some(err),
            Self::Shape(err) => Some(err),
        }
    }
}

impl From<RunError> for OptimizeError {
    fn from(err: RunError) -> Self {
        Self::Graph(err)
    }
}

impl From<ShapeError> for OptimizeError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

/// Stage of optimization in which a rule runs. Phases run in declaration
/// order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Simplify the graph into a canonical form.
    Canonicalize,
    /// Replace numerically unstable expressions.
    Stabilize,
    /// Replace general expressions with specialized operators.
    Specialize,
    /// Combine operators so that intermediate values are not materialized.
    Fusion,
    /// Allow operators to overwrite their inputs.
    Inplace,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Canonicalize,
        Phase::Stabilize,
        Phase::Specialize,
        Phase::Fusion,
        Phase::Inplace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Canonicalize => "canonicalize",
            Self::Stabilize => "stabilize",
            Self::Specialize => "specialize",
            Self::Fusion => "fusion",
            Self::Inplace => "inplace",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single operator which replaces the subgraph that computes `output_ids`
/// from `input_ids`.
#[derive(Clone, Debug)]
pub struct Fusion {
    pub name: Option<String>,
    pub op: Arc<dyn Operator + Send + Sync>,
    pub input_ids: Vec<NodeId>,
    pub output_ids: Vec<NodeId>,
}

impl Fusion {
    pub fn new<Op: Operator + Send + Sync>(
        name: Option<&str>,
        op: Op,
        input_ids: Vec<NodeId>,
        output_ids: Vec<NodeId>,
    ) -> Fusion {
        Fusion {
            name: name.map(|s| s.to_string()),
            op: Arc::new(op),
            input_ids,
            output_ids,
        }
    }
}

/// A change to a graph proposed by a [`RewriteRule`].
#[derive(Clone, Debug)]
pub enum Rewrite {
    /// Replace a subgraph with a single operator.
    ///
    /// Rejected if a value computed inside the subgraph, other than the
    /// fusion's outputs, is used outside of it or is a graph output.
    Fuse(Fusion),

    /// Redirect consumers and graph outputs of each `from` value to `to`.
    Alias(Vec<(NodeId, NodeId)>),

    /// Replace a value with a constant.
    Constant { value_id: NodeId, value: Value },

    /// Replace the operator of a node, keeping its inputs and outputs.
    ReplaceOperator {
        op_id: NodeId,
        op: Arc<dyn Operator + Send + Sync>,
    },

    /// Replace the inputs of an operator node, and optionally its operator.
    ReplaceInputs {
        op_id: NodeId,
        op: Option<Arc<dyn Operator + Send + Sync>>,
        input_ids: Vec<NodeId>,
    },
}

/// Read-only view of the graph being optimized, passed to rules.
pub struct RewriteContext<'a> {
    graph: &'a Graph,
    shapes: &'a ShapeMap,
    diagnostics: &'a Diagnostics,
}

impl<'a> RewriteContext<'a> {
    pub fn new(graph: &'a Graph, shapes: &'a ShapeMap, diagnostics: &'a Diagnostics) -> Self {
        RewriteContext {
            graph,
            shapes,
            diagnostics,
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    /// Shapes inferred at the start of the current iteration.
    ///
    /// Values created by rewrites during the iteration have no entry.
    pub fn shapes(&self) -> &'a ShapeMap {
        self.shapes
    }

    pub fn diagnostics(&self) -> &'a Diagnostics {
        self.diagnostics
    }

    /// Return the operators which use a value, once per use.
    pub fn consumers(&self, value: NodeId) -> &'a [NodeId] {
        self.graph.get_consumers(value)
    }

    pub fn is_graph_input(&self, id: NodeId) -> bool {
        self.graph.input_ids().contains(&id)
    }

    pub fn is_graph_output(&self, id: NodeId) -> bool {
        self.graph.output_ids().contains(&id)
    }

    /// Return the value of a constant node.
    pub fn constant(&self, id: NodeId) -> Option<&'a Value> {
        self.graph.get_node(id)?.as_constant().map(|c| c.value())
    }

    pub fn is_float(&self, id: NodeId) -> bool {
        self.shapes.dtype(id) == Some(DataType::Float)
    }

    /// Return true if `value` is not a graph output and is only used by
    /// `op_id`, possibly for several inputs.
    pub fn used_only_by(&self, value: NodeId, op_id: NodeId) -> bool {
        let consumers = self.consumers(value);
        !self.is_graph_output(value)
            && !consumers.is_empty()
            && consumers.iter().all(|id| *id == op_id)
    }

    /// Return true if `value` is not a graph output and is used for exactly
    /// one input of `op_id`.
    pub fn has_single_use(&self, value: NodeId, op_id: NodeId) -> bool {
        !self.is_graph_output(value) && self.consumers(value) == [op_id]
    }
}

/// A graph transformation which is applied to one operator node at a time.
pub trait RewriteRule: Send + Sync {
    /// Create state used while visiting the operators of `graph`, such as
    /// compiled patterns.
    fn prepare(&self, #[allow(unused)] graph: &Graph) -> Box<dyn Any> {
        Box::new(())
    }

    /// Visit an operator node and possibly propose a rewrite.
    ///
    /// `state` is the result of [`prepare`](RewriteRule::prepare).
    fn rewrite(
        &self,
        state: &dyn Any,
        ctx: &RewriteContext,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Option<Rewrite>;
}

/// A registered rule and the tags and phases it belongs to.
#[derive(Clone)]
pub struct RuleEntry {
    name: String,
    rule: Arc<dyn RewriteRule>,
    tags: Vec<String>,
    phases: Vec<Phase>,
}

impl RuleEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Return true if the entry has a tag. A rule's name is also a tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.name == tag || self.tags.iter().any(|t| t == tag)
    }
}

impl fmt::Debug for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEntry")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("phases", &self.phases)
            .finish()
    }
}

/// Registry of rewrite rules.
#[derive(Clone, Debug, Default)]
pub struct RuleDb {
    entries: Vec<RuleEntry>,
}

impl RuleDb {
    /// Create an empty registry.
    pub fn new() -> RuleDb {
        RuleDb::default()
    }

    /// Create a registry containing the built-in rules.
    pub fn standard() -> RuleDb {
        let mut db = RuleDb::new();
        rules::register_standard_rules(&mut db);
        db
    }

    /// Register a rule, replacing any existing rule with the same name.
    pub fn register<R: RewriteRule + 'static>(
        &mut self,
        name: &str,
        rule: R,
        tags: &[&str],
        phases: &[Phase],
    ) {
        let entry = RuleEntry {
            name: name.to_string(),
            rule: Arc::new(rule),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            phases: phases.to_vec(),
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&RuleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Return the entries selected by a query, in registration order.
    pub fn query<'a>(&'a self, query: &'a Query) -> impl Iterator<Item = &'a RuleEntry> + 'a {
        self.entries.iter().filter(move |e| query.matches(e))
    }

    /// Return all tags used by registered rules, including rule names.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self
            .entries
            .iter()
            .flat_map(|e| std::iter::once(e.name.as_str()).chain(e.tags.iter().map(|t| t.as_str())))
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

/// Selects rules from a [`RuleDb`] by tag.
///
/// An entry is selected if it has any of the `include` tags, all of the
/// `require` tags and none of the `exclude` tags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    include: Vec<String>,
    require: Vec<String>,
    exclude: Vec<String>,
}

fn add_tags<I, S>(list: &mut Vec<String>, tags: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    for tag in tags {
        let tag = tag.into();
        if !list.contains(&tag) {
            list.push(tag);
        }
    }
}

impl Query {
    /// Create a query which selects nothing.
    pub fn new() -> Query {
        Query::default()
    }

    pub fn including<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Query {
        add_tags(&mut self.include, tags);
        self
    }

    pub fn requiring<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Query {
        add_tags(&mut self.require, tags);
        self
    }

    pub fn excluding<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Query {
        add_tags(&mut self.exclude, tags);
        self
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn require(&self) -> &[String] {
        &self.require
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    pub fn matches(&self, entry: &RuleEntry) -> bool {
        self.include.iter().any(|t| entry.has_tag(t))
            && self.require.iter().all(|t| entry.has_tag(t))
            && !self.exclude.iter().any(|t| entry.has_tag(t))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "include [{}]", self.include.join(", "))?;
        if !self.require.is_empty() {
            write!(f, " require [{}]", self.require.join(", "))?;
        }
        if !self.exclude.is_empty() {
            write!(f, " exclude [{}]", self.exclude.join(", "))?;
        }
        Ok(())
    }
}

/// Statistics from an optimization run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptimizeStats {
    /// Number of rewrites applied by each rule.
    pub rewrites: FxHashMap<String, usize>,

    /// Number of rewrites which rules proposed but were rejected.
    pub rejected: usize,

    /// Iterations run in each phase that had selected rules.
    pub iterations: Vec<(Phase, usize)>,

    /// Number of nodes removed because they were no longer used.
    pub pruned: usize,

    pub nodes_before: usize,
    pub nodes_after: usize,
    pub operators_before: usize,
    pub operators_after: usize,
}

impl OptimizeStats {
    /// Return the number of rewrites applied by a rule.
    pub fn rewrite_count(&self, rule: &str) -> usize {
        self.rewrites.get(rule).copied().unwrap_or(0)
    }

    pub fn total_rewrites(&self) -> usize {
        self.rewrites.values().sum()
    }

    /// Rewrite counts sorted by rule name.
    pub fn sorted_rewrites(&self) -> Vec<(&str, usize)> {
        let mut rewrites: Vec<(&str, usize)> = self
            .rewrites
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        rewrites.sort();
        rewrites
    }
}

impl fmt::Display for OptimizeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "operators: {} -> {}, nodes: {} -> {}",
            self.operators_before, self.operators_after, self.nodes_before, self.nodes_after
        )?;
        for (phase, iterations) in &self.iterations {
            writeln!(f, "  {}: {} iterations", phase, iterations)?;
        }
        for (name, count) in self.sorted_rewrites() {
            writeln!(f, "  {} x{}", name, count)?;
        }
        if self.rejected > 0 {
            writeln!(f, "  rejected x{}", self.rejected)?;
        }
        Ok(())
    }
}

/// Result of [`GraphOptimizer::optimize`].
#[derive(Clone, Debug)]
pub struct OptimizedGraph {
    pub graph: Graph,
    pub stats: OptimizeStats,
}

/// Default limit on the number of iterations of each phase.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Applies the rules selected by a query to graphs.
pub struct GraphOptimizer {
    db: Arc<RuleDb>,
    query: Query,
    max_iterations: usize,
    diagnostics: Diagnostics,
}

impl GraphOptimizer {
    /// Create an optimizer using the rules of [`RuleDb::standard`].
    pub fn new(query: Query) -> Self {
        Self::with_db(Arc::new(RuleDb::standard()), query)
    }

    pub fn with_db(db: Arc<RuleDb>, query: Query) -> Self {
        GraphOptimizer {
            db,
            query,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            diagnostics: Diagnostics::from_env(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_diagnostics(mut self, level: DiagnosticLevel) -> Self {
        self.diagnostics = Diagnostics::new(level);
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Return the names of rules this optimizer applies.
    pub fn selected_rules(&self) -> Vec<&str> {
        self.db.query(&self.query).map(|e| e.name()).collect()
    }

    /// Apply optimizations to a graph.
    ///
    /// The graph's inputs are preserved. Outputs may be redirected to other
    /// values, including inputs and constants. Other nodes may be modified,
    /// removed or replaced.
    pub fn optimize(&self, mut graph: Graph) -> Result<OptimizedGraph, OptimizeError> {
        graph.validate()?;

        let mut stats = OptimizeStats {
            nodes_before: graph.node_count(),
            operators_before: graph.operator_count(),
            ..Default::default()
        };

        for phase in Phase::ALL {
            let rules: Vec<&RuleEntry> = self
                .db
                .query(&self.query)
                .filter(|e| e.phases().contains(&phase))
                .collect();
            if rules.is_empty() {
                continue;
            }
            let iterations = self.run_phase(&mut graph, &rules, &mut stats)?;
            stats.iterations.push((phase, iterations));
            stats.pruned += prune_unused(&mut graph);
        }

        stats.nodes_after = graph.node_count();
        stats.operators_after = graph.operator_count();
        Ok(OptimizedGraph { graph, stats })
    }

    /// Apply `rules` until none apply or the iteration limit is reached.
    /// Returns the number of iterations run.
    fn run_phase(
        &self,
        graph: &mut Graph,
        rules: &[&RuleEntry],
        stats: &mut OptimizeStats,
    ) -> Result<usize, OptimizeError> {
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;

            let shapes = infer_shapes(graph, &InferOptions::default())?;
            let states: Vec<Box<dyn Any>> = rules.iter().map(|e| e.rule.prepare(graph)).collect();
            let mut changed = false;

            for op_id in graph.topological_order()? {
                let found = {
                    // Earlier rewrites in this iteration may have removed
                    // the node.
                    let Some(op_node) = graph.get_node(op_id).and_then(|n| n.as_operator()) else {
                        continue;
                    };
                    let ctx = RewriteContext::new(graph, &shapes, &self.diagnostics);

                    // Operators replaced earlier in this iteration are
                    // pruned rather than rewritten again.
                    let unused = op_node
                        .output_ids()
                        .iter()
                        .all(|id| ctx.consumers(*id).is_empty() && !ctx.is_graph_output(*id));
                    if unused {
                        continue;
                    }

                    let mut found = None;
                    for (entry, state) in rules.iter().zip(&states) {
                        let Some(rewrite) = entry.rule.rewrite(state.as_ref(), &ctx, op_id, op_node)
                        else {
                            continue;
                        };
                        match check_rewrite(graph, &rewrite) {
                            Ok(removed_ops) => {
                                found = Some((entry.name(), rewrite, removed_ops));
                                break;
                            }
                            Err(reason) => {
                                stats.rejected += 1;
                                self.diagnostics.warn(
                                    graph,
                                    op_id,
                                    format_args!("{} rejected: {}", entry.name(), reason),
                                );
                            }
                        }
                    }
                    found
                };

                let Some((rule_name, rewrite, removed_ops)) = found else {
                    continue;
                };
                self.diagnostics
                    .info(graph, op_id, format_args!("applied {}", rule_name));
                apply_rewrite(graph, rewrite, &removed_ops);
                *stats.rewrites.entry(rule_name.to_string()).or_default() += 1;
                changed = true;
            }

            if !changed {
                break;
            }
            stats.pruned += prune_unused(graph);
        }
        Ok(iterations)
    }
}

fn is_value_or_constant(graph: &Graph, id: NodeId) -> bool {
    matches!(graph.get_node(id), Some(Node::Value(_) | Node::Constant(_)))
}

/// Check that a rewrite can be applied.
///
/// Returns the operators replaced by a fusion, or an empty list for other
/// rewrites.
fn check_rewrite(graph: &Graph, rewrite: &Rewrite) -> Result<Vec<NodeId>, String> {
    match rewrite {
        Rewrite::Fuse(fusion) => {
            if fusion.output_ids.is_empty() {
                return Err("fusion has no outputs".into());
            }
            let mut input_ids = fusion.input_ids.clone();

            // Operators may use a value for several inputs, but planning
            // requires unique inputs.
            input_ids.sort();
            input_ids.dedup();

            let subgraph_ops = graph
                .execution_plan(&input_ids, &fusion.output_ids)
                .map_err(|err| err.to_string())?;
            if subgraph_ops.is_empty() {
                return Err("fusion replaces no operators".into());
            }
            let subgraph: FxHashSet<NodeId> = subgraph_ops.iter().copied().collect();
            for op_id in &subgraph_ops {
                let Some(op_node) = graph.get_node(*op_id).and_then(|n| n.as_operator()) else {
                    continue;
                };
                for output in op_node.output_ids() {
                    if fusion.output_ids.contains(output) {
                        continue;
                    }
                    if graph.output_ids().contains(output) {
                        return Err(format!(
                            "intermediate value \"{}\" is a graph output",
                            graph.node_name(*output)
                        ));
                    }
                    if graph.get_consumers(*output).iter().any(|c| !subgraph.contains(c)) {
                        return Err(format!(
                            "intermediate value \"{}\" is used outside the fused subgraph",
                            graph.node_name(*output)
                        ));
                    }
                }
            }
            Ok(subgraph_ops)
        }
        Rewrite::Alias(pairs) => {
            let mut outputs: Vec<NodeId> = graph.output_ids().to_vec();
            for &(from, to) in pairs {
                if from == to {
                    return Err("value aliased to itself".into());
                }
                if !is_value_or_constant(graph, from) || !is_value_or_constant(graph, to) {
                    return Err("alias of a node which is not a value".into());
                }
                if graph.input_ids().contains(&from) {
                    return Err(format!(
                        "graph input \"{}\" cannot be replaced",
                        graph.node_name(from)
                    ));
                }
                if outputs.contains(&from) && outputs.contains(&to) {
                    return Err(format!(
                        "alias would duplicate graph output \"{}\"",
                        graph.node_name(to)
                    ));
                }
                for output in outputs.iter_mut().filter(|id| **id == from) {
                    *output = to;
                }
            }
            Ok(Vec::new())
        }
        Rewrite::Constant { value_id, .. } => {
            if !matches!(graph.get_node(*value_id), Some(Node::Value(_)))
                || graph.input_ids().contains(value_id)
            {
                return Err("only computed values can be replaced by constants".into());
            }
            Ok(Vec::new())
        }
        Rewrite::ReplaceOperator { op_id, .. } => {
            if graph.get_node(*op_id).and_then(|n| n.as_operator()).is_none() {
                return Err("node is not an operator".into());
            }
            Ok(Vec::new())
        }
        Rewrite::ReplaceInputs {
            op_id, input_ids, ..
        } => {
            let Some(op_node) = graph.get_node(*op_id).and_then(|n| n.as_operator()) else {
                return Err("node is not an operator".into());
            };
            for input in input_ids {
                if !is_value_or_constant(graph, *input) || op_node.output_ids().contains(input) {
                    return Err(format!("invalid input \"{}\"", graph.node_name(*input)));
                }
            }
            Ok(Vec::new())
        }
    }
}

fn apply_rewrite(graph: &mut Graph, rewrite: Rewrite, removed_ops: &[NodeId]) {
    match rewrite {
        Rewrite::Fuse(fusion) => {
            graph.remove_nodes(removed_ops);

            // The fused operator is added after removal so that it can reuse
            // the name of the operator it replaces.
            graph.add_op(
                fusion.name.as_deref(),
                fusion.op,
                &fusion.input_ids,
                &fusion.output_ids,
            );
        }
        Rewrite::Alias(pairs) => {
            for (from, to) in pairs {
                graph.replace_value(from, to);
            }
        }
        Rewrite::Constant { value_id, value } => {
            let name = graph
                .get_node(value_id)
                .and_then(|n| n.name())
                .map(|s| s.to_string());
            let const_id = graph.add_constant(name.as_deref(), value);
            graph.replace_value(value_id, const_id);
        }
        Rewrite::ReplaceOperator { op_id, op } => {
            graph.replace_operator(op_id, op);
        }
        Rewrite::ReplaceInputs {
            op_id,
            op,
            input_ids,
        } => {
            if let Some(op) = op {
                graph.replace_operator(op_id, op);
            }
            graph.replace_op_inputs(op_id, &input_ids);
        }
    }
}

/// Remove nodes which don't contribute to the graph's outputs. Graph inputs
/// are kept. Returns the number of nodes removed.
pub fn prune_unused(graph: &mut Graph) -> usize {
    let mut live: FxHashSet<NodeId> = graph
        .input_ids()
        .iter()
        .chain(graph.output_ids())
        .copied()
        .collect();
    let mut pending: Vec<NodeId> = graph.output_ids().to_vec();
    while let Some(value_id) = pending.pop() {
        let Some((op_id, op_node)) = graph.get_source_node(value_id) else {
            continue;
        };
        if !live.insert(op_id) {
            continue;
        }
        live.extend(op_node.output_ids().iter().copied());
        for &input in op_node.input_ids() {
            if live.insert(input) {
                pending.push(input);
            }
        }
    }

    let dead: Vec<NodeId> = graph
        .iter()
        .map(|(id, _)| id)
        .filter(|id| !live.contains(id))
        .collect();
    graph.remove_nodes(&dead);
    dead.len()
}
