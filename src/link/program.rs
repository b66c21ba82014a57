use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use super::debug::{compare_values, ShapeChecker, ATOL, RTOL};
use super::{Strategy, Thunk};
use crate::env::env_flag;
use crate::graph::{Graph, Node, NodeId, RunError};
use crate::infer_shapes::ShapeMap;
use crate::operator::{InputList, OutputList};
use crate::timing::{RunTiming, TimingRecord, TimingSort};
use crate::value::{Value, ValueMeta};

/// Options that control logging and profiling of program runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    /// Print a timing summary at the end of the run.
    pub timing: bool,

    /// Order of entries in the timing summary.
    pub timing_sort: TimingSort,

    /// Break down timings of each operator by input shape.
    pub timing_by_shape: bool,

    /// Print details of each step as it runs.
    pub verbose: bool,
}

impl RunOptions {
    /// Read options from the `STEN_TIMING` and `STEN_VERBOSE` environment
    /// variables.
    pub fn from_env() -> RunOptions {
        RunOptions {
            timing: env_flag("STEN_TIMING", false),
            verbose: env_flag("STEN_VERBOSE", false),
            ..Default::default()
        }
    }
}

/// Count of remaining uses of each intermediate value.
struct RefCount {
    counts: FxHashMap<NodeId, usize>,
}

impl RefCount {
    fn new() -> RefCount {
        RefCount {
            counts: FxHashMap::default(),
        }
    }

    fn inc(&mut self, id: NodeId) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    /// Decrement the count for a value and return the new count.
    fn dec(&mut self, id: NodeId) -> Option<usize> {
        let count = self.counts.get_mut(&id)?;
        *count = count.saturating_sub(1);
        Some(*count)
    }

    fn count(&self, id: NodeId) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }
}

/// A linked graph, ready to run.
///
/// Programs own a copy of the graph they were linked from, so they can be
/// shared between threads and run concurrently.
#[derive(Debug)]
pub struct Program {
    graph: Graph,
    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,
    steps: Vec<(NodeId, Thunk)>,

    /// Values produced by a step of the program.
    temp_ids: FxHashSet<NodeId>,

    gc: bool,

    /// Static shapes that runtime values are checked against.
    shapes: Option<ShapeMap>,
}

impl Program {
    pub(crate) fn new(
        graph: Graph,
        input_ids: &[NodeId],
        output_ids: &[NodeId],
        steps: Vec<(NodeId, Thunk)>,
        gc: bool,
        shapes: Option<ShapeMap>,
    ) -> Program {
        let temp_ids = steps
            .iter()
            .filter_map(|(op_id, _)| graph.get_node(*op_id).and_then(|n| n.as_operator()))
            .flat_map(|op_node| op_node.output_ids().iter().copied())
            .collect();
        Program {
            graph,
            input_ids: input_ids.to_vec(),
            output_ids: output_ids.to_vec(),
            steps,
            temp_ids,
            gc,
            shapes,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.input_ids
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.output_ids
    }

    /// Return the number of steps in the program.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Return the operator node ID and strategy of each step, in order.
    pub fn strategies(&self) -> Vec<(NodeId, Strategy)> {
        self.steps
            .iter()
            .map(|(id, thunk)| (*id, thunk.strategy()))
            .collect()
    }

    /// Return true if intermediate values are freed once no longer needed.
    pub fn gc(&self) -> bool {
        self.gc
    }

    /// Run the program and return its outputs, in the order of
    /// [`output_ids`](Program::output_ids).
    ///
    /// `inputs` must provide a value for each of the program's inputs.
    pub fn run(&self, inputs: Vec<(NodeId, Value)>, opts: &RunOptions) -> Result<Vec<Value>, RunError> {
        let (outputs, timing) = self.run_impl(inputs, opts, opts.timing)?;
        if let Some(timing) = timing {
            println!(
                "Program run of {} steps finished in {:.3}ms",
                self.steps.len(),
                timing.total_time.as_secs_f64() * 1000.0
            );
            print!("{}", timing.display(opts.timing_sort, opts.timing_by_shape));
        }
        Ok(outputs)
    }

    /// Run the program and return its outputs and per-step timings.
    pub fn run_with_timing(
        &self,
        inputs: Vec<(NodeId, Value)>,
        opts: &RunOptions,
    ) -> Result<(Vec<Value>, RunTiming), RunError> {
        let (outputs, timing) = self.run_impl(inputs, opts, true)?;
        Ok((outputs, timing.unwrap_or_default()))
    }

    fn run_impl(
        &self,
        inputs: Vec<(NodeId, Value)>,
        opts: &RunOptions,
        record_timing: bool,
    ) -> Result<(Vec<Value>, Option<RunTiming>), RunError> {
        let run_start = Instant::now();

        let mut input_values: FxHashMap<NodeId, Value> = FxHashMap::default();
        for (id, value) in inputs {
            if !self.input_ids.contains(&id) {
                return Err(RunError::invalid_node_id());
            }
            input_values.insert(id, value);
        }
        if let Some(missing) = self.input_ids.iter().find(|id| !input_values.contains_key(id)) {
            return Err(RunError::input_mismatch(
                &self.graph.node_name(*missing),
                "no value was provided".to_string(),
            ));
        }

        let mut checker = self.shapes.as_ref().map(ShapeChecker::new);
        if let Some(checker) = checker.as_mut() {
            for (id, value) in &input_values {
                checker
                    .observe(*id, value)
                    .map_err(|err| RunError::input_mismatch(&self.graph.node_name(*id), err))?;
            }
        }

        // Count uses of each intermediate value, so it can be freed once no
        // longer needed. Outputs get an extra use so they are kept.
        let mut refcount = RefCount::new();
        for (op_id, _) in &self.steps {
            if let Some(op_node) = self.graph.get_node(*op_id).and_then(|n| n.as_operator()) {
                for id in op_node.input_ids() {
                    if self.temp_ids.contains(id) {
                        refcount.inc(*id);
                    }
                }
            }
        }
        for id in &self.output_ids {
            refcount.inc(*id);
        }

        let mut temp_values: FxHashMap<NodeId, Value> = FxHashMap::default();
        let mut records = Vec::new();

        for (step, (op_id, thunk)) in self.steps.iter().enumerate() {
            let Some(op_node) = self.graph.get_node(*op_id).and_then(|n| n.as_operator()) else {
                return Err(RunError::invalid_node_id());
            };
            let node_name = self.graph.node_name(*op_id);
            let step_start = Instant::now();

            // Choose an input to overwrite. Non-commutative operators can
            // only overwrite their first input. For commutative operators
            // choose the largest, which is most likely to match the output
            // shape.
            let in_place_id = if thunk.can_run_in_place() {
                if thunk.is_commutative() {
                    op_node
                        .input_ids()
                        .iter()
                        .max_by_key(|id| temp_values.get(*id).map(|v| v.len()).unwrap_or(0))
                        .copied()
                } else {
                    op_node.input_ids().first().copied()
                }
            } else {
                None
            };

            let input_meta: Vec<Option<ValueMeta>> = if record_timing || opts.verbose {
                op_node
                    .input_ids()
                    .iter()
                    .map(|id| {
                        self.lookup(*id, &temp_values, &input_values)
                            .map(|v| v.to_meta())
                    })
                    .collect()
            } else {
                Vec::new()
            };

            // Only intermediate values with no remaining uses can be
            // overwritten.
            let in_place_input = in_place_id.and_then(|id| {
                if refcount.count(id) == 1 {
                    let value = temp_values.remove(&id)?;
                    refcount.dec(id);
                    Some(value)
                } else {
                    None
                }
            });

            let mut op_inputs: Vec<&Value> = Vec::with_capacity(op_node.input_ids().len());
            let mut skip_id = in_place_input.as_ref().and(in_place_id);
            for id in op_node.input_ids() {
                if skip_id == Some(*id) {
                    skip_id = None;
                    continue;
                }
                let Some(value) = self.lookup(*id, &temp_values, &input_values) else {
                    return Err(RunError::planning_error(format!(
                        "Input \"{}\" of operator \"{}\" was not computed",
                        self.graph.node_name(*id),
                        node_name
                    )));
                };
                op_inputs.push(value);
            }

            let result: Result<OutputList, RunError> = match in_place_input {
                Some(input) => {
                    let mut error_meta = vec![input.to_meta()];
                    error_meta.extend(op_inputs.iter().map(|v| v.to_meta()));
                    let other = InputList::from(op_inputs.as_slice()).with_first_input_omitted(true);
                    thunk
                        .run_in_place(input, &other)
                        .map(|output| [output].into())
                        .map_err(|err| RunError::op_error(&node_name, err, error_meta))
                }
                None => {
                    let inputs = InputList::from(op_inputs.as_slice());
                    if thunk.strategy() == Strategy::Checked {
                        self.run_checked(thunk, &inputs, &node_name)
                    } else {
                        thunk.run(&inputs).map_err(|err| {
                            let meta = inputs.iter().map(|v| v.to_meta()).collect();
                            RunError::op_error(&node_name, err, meta)
                        })
                    }
                }
            };
            let elapsed = step_start.elapsed();

            // Log before checking the result, so that a failing step's
            // inputs are included.
            if opts.verbose {
                println!(
                    "#{} {} ({}) [{}]",
                    step,
                    thunk.operator().name(),
                    node_name,
                    thunk.strategy()
                );
                for (index, (id, meta)) in op_node.input_ids().iter().zip(&input_meta).enumerate() {
                    if let Some(meta) = meta {
                        println!("  input {}: {} ({})", index, self.graph.node_name(*id), meta);
                    }
                }
                if let Ok(outputs) = &result {
                    for (index, (id, output)) in
                        op_node.output_ids().iter().zip(outputs.iter()).enumerate()
                    {
                        println!(
                            "  output {}: {} ({})",
                            index,
                            self.graph.node_name(*id),
                            output.to_meta()
                        );
                    }
                }
                println!("  time: {:.3}ms", elapsed.as_secs_f64() * 1000.0);
            }

            let outputs = result?;

            if record_timing {
                records.push(TimingRecord {
                    name: thunk.operator().name().to_string(),
                    node_name: node_name.clone(),
                    strategy: thunk.strategy(),
                    input_meta,
                    elapsed,
                });
            }

            if outputs.len() != op_node.output_ids().len() {
                return Err(RunError::output_mismatch(
                    &node_name,
                    format!(
                        "operator returned {} outputs but {} were expected",
                        outputs.len(),
                        op_node.output_ids().len()
                    ),
                ));
            }

            if let Some(checker) = checker.as_mut() {
                for (id, output) in op_node.output_ids().iter().zip(outputs.iter()) {
                    checker.observe(*id, output).map_err(|err| {
                        RunError::debug_mismatch(&node_name, format!("output \"{}\" {}", self.graph.node_name(*id), err))
                    })?;
                }
            }

            for (id, output) in op_node.output_ids().iter().zip(outputs) {
                temp_values.insert(*id, output);
            }

            // Free intermediate values which are no longer needed.
            for id in op_node.input_ids() {
                if refcount.dec(*id) == Some(0) && self.gc {
                    temp_values.remove(id);
                }
            }
        }

        let mut outputs = Vec::with_capacity(self.output_ids.len());
        for id in &self.output_ids {
            let value = temp_values
                .remove(id)
                .or_else(|| input_values.get(id).cloned())
                .or_else(|| match self.graph.get_node(*id) {
                    Some(Node::Constant(constant)) => Some(constant.value().clone()),
                    _ => None,
                });
            match value {
                Some(value) => outputs.push(value),
                None => {
                    return Err(RunError::planning_error(format!(
                        "Output \"{}\" was not computed",
                        self.graph.node_name(*id)
                    )));
                }
            }
        }

        let timing = record_timing.then(|| RunTiming {
            records,
            total_time: run_start.elapsed(),
        });
        Ok((outputs, timing))
    }

    /// Return the value of an input, constant or computed intermediate.
    fn lookup<'a>(
        &'a self,
        id: NodeId,
        temp_values: &'a FxHashMap<NodeId, Value>,
        input_values: &'a FxHashMap<NodeId, Value>,
    ) -> Option<&'a Value> {
        temp_values
            .get(&id)
            .or_else(|| input_values.get(&id))
            .or_else(|| match self.graph.get_node(id) {
                Some(Node::Constant(constant)) => Some(constant.value()),
                _ => None,
            })
    }

    /// Run the reference implementation of a step and compare it against
    /// the native kernel, if there is one.
    fn run_checked(
        &self,
        thunk: &Thunk,
        inputs: &InputList,
        node_name: &str,
    ) -> Result<OutputList, RunError> {
        let input_meta = || inputs.iter().map(|v| v.to_meta()).collect();
        let expected = thunk
            .operator()
            .run(inputs)
            .map_err(|err| RunError::op_error(node_name, err, input_meta()))?;

        let Some(kernel) = thunk.checked_kernel() else {
            return Ok(expected);
        };
        let actual = kernel.run(inputs).map_err(|err| {
            RunError::debug_mismatch(node_name, format!("native kernel failed: {}", err))
        })?;
        if actual.len() != expected.len() {
            return Err(RunError::debug_mismatch(
                node_name,
                format!(
                    "native kernel returned {} outputs but reference returned {}",
                    actual.len(),
                    expected.len()
                ),
            ));
        }
        for (i, (actual, expected)) in actual.iter().zip(expected.iter()).enumerate() {
            compare_values(actual, expected, ATOL, RTOL).map_err(|err| {
                RunError::debug_mismatch(node_name, format!("output {}: {}", i, err))
            })?;
        }
        Ok(expected)
    }
}
