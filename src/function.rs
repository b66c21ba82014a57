//! Compiled functions.
//!
//! [`compile`] turns a graph into a [`Function`] by optimizing it with the
//! rules selected by a [`Mode`] and linking the result.

use std::error::Error;
use std::fmt;

use sten_shape_inference::{EvalError, SymbolMap};

use crate::graph::{Dimension, Graph, Node, NodeId, RunError};
use crate::infer_shapes::{infer_shapes, InferOptions, ShapeError, ShapeMap};
use crate::link::{LinkError, Program, RunOptions, Strategy};
use crate::mode::Mode;
use crate::optimize::{OptimizeError, OptimizeStats};
use crate::printer::debug_print;
use crate::timing::RunTiming;
use crate::value::{DataType, Value};

/// Errors when compiling a graph.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// The graph is invalid, eg. it contains a cycle.
    Graph(RunError),
    Optimize(OptimizeError),
    Shape(ShapeError),
    Link(LinkError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "invalid graph: {}", err),
            Self::Optimize(err) => write!(f, "{}", err),
            Self::Shape(err) => write!(f, "shape inference failed: {}", err),
            Self::Link(err) => write!(f, "{}", err),
        }
    }
}

impl Error for CompileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Graph(err) => Some(err),
            Self::Optimize(err) => Some(err),
            Self::Shape(err) => Some(err),
            Self::Link(err) => Some(err),
        }
    }
}

impl From<RunError> for CompileError {
    fn from(err: RunError) -> Self {
        Self::Graph(err)
    }
}

impl From<OptimizeError> for CompileError {
    fn from(err: OptimizeError) -> Self {
        Self::Optimize(err)
    }
}

impl From<ShapeError> for CompileError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

impl From<LinkError> for CompileError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

/// Compile a graph using a given mode.
///
/// The graph is validated, optimized if the mode has an optimizer, and then
/// linked using the mode's linker. The inputs and outputs of the function
/// are those of the graph.
pub fn compile(graph: Graph, mode: &Mode) -> Result<Function, CompileError> {
    graph.validate()?;

    let (graph, stats) = match mode.graph_optimizer() {
        Some(optimizer) => {
            let optimized = optimizer.optimize(graph)?;
            (optimized.graph, optimized.stats)
        }
        None => {
            let stats = OptimizeStats {
                nodes_before: graph.node_count(),
                nodes_after: graph.node_count(),
                operators_before: graph.operator_count(),
                operators_after: graph.operator_count(),
                ..Default::default()
            };
            (graph, stats)
        }
    };

    let shapes = infer_shapes(&graph, &InferOptions::default())?;
    let program = mode
        .linker()
        .link(&graph, graph.input_ids(), graph.output_ids())?;

    Ok(Function {
        program,
        shapes,
        stats,
        mode_name: mode.name().to_string(),
        run_options: RunOptions::from_env(),
    })
}

/// A compiled graph which can be called with input values.
///
/// Functions can be shared between threads and called concurrently.
#[derive(Debug)]
pub struct Function {
    program: Program,

    /// Static shapes of values in the optimized graph.
    shapes: ShapeMap,

    stats: OptimizeStats,
    mode_name: String,
    run_options: RunOptions,
}

impl Function {
    /// Return the optimized graph.
    pub fn graph(&self) -> &Graph {
        self.program.graph()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Return the name of the mode this function was compiled with.
    pub fn mode_name(&self) -> &str {
        &self.mode_name
    }

    /// Return statistics about the optimizations applied when compiling.
    pub fn stats(&self) -> &OptimizeStats {
        &self.stats
    }

    /// Return the static shapes of values in the optimized graph.
    pub fn shapes(&self) -> &ShapeMap {
        &self.shapes
    }

    /// Return the input IDs, in the order values are passed to [`run`](Function::run).
    pub fn input_ids(&self) -> &[NodeId] {
        self.program.input_ids()
    }

    pub fn output_ids(&self) -> &[NodeId] {
        self.program.output_ids()
    }

    /// Return the strategy used to execute each operator, in execution order.
    pub fn strategies(&self) -> Vec<(NodeId, Strategy)> {
        self.program.strategies()
    }

    /// Set options used by [`run`](Function::run).
    ///
    /// The default options are read from the environment.
    pub fn set_run_options(&mut self, opts: RunOptions) {
        self.run_options = opts;
    }

    /// Return the statically inferred shape of each output. Sizes which
    /// depend on input dimensions are symbolic.
    pub fn output_shapes(&self) -> Vec<Option<Vec<Dimension>>> {
        self.output_ids()
            .iter()
            .map(|id| self.shapes.dims(*id))
            .collect()
    }

    /// Evaluate the static output shapes given values for the symbolic
    /// dimensions of the inputs.
    ///
    /// Entries are `None` for outputs whose rank could not be inferred.
    pub fn resolve_output_shapes(
        &self,
        symbols: &SymbolMap,
    ) -> Result<Vec<Option<Vec<usize>>>, EvalError> {
        self.output_ids()
            .iter()
            .map(|id| match self.shapes.get(*id) {
                Some(shape) => shape.eval_shape(symbols),
                None => Ok(None),
            })
            .collect()
    }

    /// Check input values against the declared inputs of the graph and
    /// return the sizes bound to symbolic dimensions.
    ///
    /// Each symbolic dimension name must have the same size in every input
    /// that uses it.
    pub fn bind_inputs(&self, inputs: &[Value]) -> Result<SymbolMap, RunError> {
        let input_ids = self.input_ids();
        if inputs.len() != input_ids.len() {
            return Err(RunError::input_mismatch(
                "inputs",
                format!("expected {} inputs but got {}", input_ids.len(), inputs.len()),
            ));
        }

        let mut symbols = SymbolMap::new();
        for (&id, value) in input_ids.iter().zip(inputs) {
            let Some(Node::Value(node)) = self.graph().get_node(id) else {
                continue;
            };
            let name = self.graph().node_name(id);
            if let Some(dtype) = node.dtype() {
                check_dtype(&name, dtype, value)?;
            }
            if let Some(dims) = node.shape() {
                bind_shape(&name, dims, value.shape(), &mut symbols)?;
            }
        }
        Ok(symbols)
    }

    /// Run the function with positional input values.
    pub fn run(&self, inputs: Vec<Value>) -> Result<Vec<Value>, RunError> {
        self.run_with_options(inputs, &self.run_options)
    }

    pub fn run_with_options(
        &self,
        inputs: Vec<Value>,
        opts: &RunOptions,
    ) -> Result<Vec<Value>, RunError> {
        self.bind_inputs(&inputs)?;
        let inputs = self.input_ids().iter().copied().zip(inputs).collect();
        self.program.run(inputs, opts)
    }

    /// Run the function and return the outputs along with per-operator
    /// timings.
    pub fn run_with_timing(&self, inputs: Vec<Value>) -> Result<(Vec<Value>, RunTiming), RunError> {
        self.bind_inputs(&inputs)?;
        let inputs = self.input_ids().iter().copied().zip(inputs).collect();
        self.program.run_with_timing(inputs, &self.run_options)
    }

    /// Render the optimized graph with inferred shapes.
    pub fn debug_print(&self) -> String {
        debug_print(self.graph(), &self.shapes)
    }
}

fn check_dtype(name: &str, expected: DataType, value: &Value) -> Result<(), RunError> {
    if value.dtype() != expected {
        return Err(RunError::input_mismatch(
            name,
            format!("expected {} tensor but got {}", expected, value.dtype()),
        ));
    }
    Ok(())
}

fn bind_shape(
    name: &str,
    dims: &[Dimension],
    shape: &[usize],
    symbols: &mut SymbolMap,
) -> Result<(), RunError> {
    if dims.len() != shape.len() {
        return Err(RunError::input_mismatch(
            name,
            format!("expected {} dims but got shape {:?}", dims.len(), shape),
        ));
    }

    for (axis, (dim, &size)) in dims.iter().zip(shape).enumerate() {
        match dim {
            Dimension::Fixed(expected) => {
                if size != *expected {
                    return Err(RunError::input_mismatch(
                        name,
                        format!("expected size {} for dim {} but got {}", expected, axis, size),
                    ));
                }
            }
            Dimension::Symbolic(sym) => {
                let Ok(size) = i32::try_from(size) else {
                    return Err(RunError::input_mismatch(
                        name,
                        format!("size {} of dim {} is too large", size, axis),
                    ));
                };
                match symbols.get(sym) {
                    Some(bound) if bound != size => {
                        return Err(RunError::input_mismatch(
                            name,
                            format!(
                                "dim \"{}\" has size {} but another input has size {}",
                                sym, size, bound
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        symbols.insert(sym, size);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sten_shape_inference::SymbolMap;
    use sten_testing::{expect_all_close, TestCases};

    use super::{compile, CompileError, Function};
    use crate::graph::builder::{dims, Expr};
    use crate::graph::{Dimension, Graph, RunErrorKind};
    use crate::link::{LinkError, NativeLinker, Strategy};
    use crate::mode::{Mode, MODE_NAMES};
    use crate::ops::{Elementwise, Reduce, ReduceOp, ScalarOp, Transpose};
    use crate::tensor::Tensor;
    use crate::value::{DataType, Value};

    /// Graph computing `sum(exp(x) * 2 + y, axis=-1)` for inputs of shape
    /// `[batch, 3]`.
    fn test_graph() -> Graph {
        let x = Expr::value_with_info("x", DataType::Float, &dims!("batch", 3));
        let y = Expr::value_with_info("y", DataType::Float, &dims!("batch", 3));
        let exp = x.unary(Elementwise::new(ScalarOp::Exp));
        let out = (exp * 2f32 + y.clone())
            .unary(Reduce::new(ReduceOp::Sum, Some(vec![-1]), false));
        Expr::make_graph([x, y], [out])
    }

    fn float_tensor(shape: &[usize], data: Vec<f32>) -> Value {
        Tensor::from_data(shape, data).into()
    }

    #[test]
    fn test_compile_modes() {
        let x = vec![0f32, 0.5, 1., -1., 2., 0.25];
        let y = vec![1f32, 2., 3., 4., 5., 6.];
        let expected: Vec<f32> = x
            .chunks(3)
            .zip(y.chunks(3))
            .map(|(x, y)| x.iter().zip(y).map(|(x, y)| x.exp() * 2. + y).sum())
            .collect();

        MODE_NAMES.test_each(|name| {
            let mode = Mode::from_name(name).unwrap();
            let func = compile(test_graph(), &mode).unwrap();
            assert_eq!(func.mode_name(), *name);

            let outputs = func
                .run(vec![
                    float_tensor(&[2, 3], x.clone()),
                    float_tensor(&[2, 3], y.clone()),
                ])
                .unwrap();
            let out: Tensor<f32> = outputs[0].clone().try_into().unwrap();
            assert_eq!(out.shape(), &[2]);
            expect_all_close(out.data(), &expected, 1e-5, 1e-5).unwrap();
        });
    }

    #[test]
    fn test_fast_run_fuses_elementwise_ops() {
        let func = compile(test_graph(), &Mode::fast_run()).unwrap();
        let op_names: Vec<&str> = func
            .graph()
            .iter_operators()
            .map(|(_, op)| op.operator().name())
            .collect();
        assert_eq!(op_names, ["ReduceSum", "FusedElementwise"]);
        assert_eq!(func.stats().rewrite_count("elementwise_fusion"), 1);
        assert!(func
            .strategies()
            .iter()
            .all(|(_, strategy)| *strategy == Strategy::Native));

        let func = compile(test_graph(), &Mode::none()).unwrap();
        assert_eq!(func.stats().total_rewrites(), 0);
        assert_eq!(func.graph().operator_count(), 4);
        assert!(func
            .strategies()
            .iter()
            .all(|(_, strategy)| *strategy == Strategy::Interpreted));
    }

    #[test]
    fn test_output_shapes() {
        let func = compile(test_graph(), &Mode::fast_run()).unwrap();
        assert_eq!(
            func.output_shapes(),
            [Some(vec![Dimension::Symbolic("batch".into())])]
        );

        let mut symbols = SymbolMap::new();
        symbols.insert("batch", 5);
        assert_eq!(func.resolve_output_shapes(&symbols), Ok(vec![Some(vec![5])]));
        assert!(func.resolve_output_shapes(&SymbolMap::new()).is_err());

        let symbols = func
            .bind_inputs(&[
                float_tensor(&[4, 3], vec![0.; 12]),
                float_tensor(&[4, 3], vec![0.; 12]),
            ])
            .unwrap();
        assert_eq!(symbols.get("batch"), Some(4));
        let outputs = func
            .run(vec![
                float_tensor(&[4, 3], vec![0.; 12]),
                float_tensor(&[4, 3], vec![0.; 12]),
            ])
            .unwrap();
        assert_eq!(
            func.resolve_output_shapes(&symbols).unwrap(),
            [Some(outputs[0].shape().to_vec())]
        );
    }

    #[test]
    fn test_zero_size_dim() {
        MODE_NAMES.test_each(|name| {
            let x = Expr::value_with_info("x", DataType::Float, &dims!("batch", 3));
            let y = Expr::value_with_info("y", DataType::Float, &dims!("batch", 3));
            let out = x.unary(Elementwise::new(ScalarOp::Exp)) * 2f32 + y.clone();
            let graph = Expr::make_graph([x, y], [out]);
            let func = compile(graph, &Mode::from_name(name).unwrap()).unwrap();

            let inputs = || vec![float_tensor(&[0, 3], vec![]), float_tensor(&[0, 3], vec![])];
            let symbols = func.bind_inputs(&inputs()).unwrap();
            assert_eq!(symbols.get("batch"), Some(0));
            assert_eq!(func.resolve_output_shapes(&symbols), Ok(vec![Some(vec![0, 3])]));

            let outputs = func.run(inputs()).unwrap();
            assert_eq!(outputs[0].shape(), &[0, 3]);
        });
    }

    #[test]
    fn test_input_mismatch() {
        #[derive(Debug)]
        struct Case {
            inputs: Vec<Value>,
            error: &'static str,
        }

        let cases = [
            Case {
                inputs: vec![float_tensor(&[1, 3], vec![0.; 3])],
                error: "expected 2 inputs but got 1",
            },
            Case {
                inputs: vec![
                    Tensor::from_data(&[1, 3], vec![0i32; 3]).into(),
                    float_tensor(&[1, 3], vec![0.; 3]),
                ],
                error: "expected f32 tensor but got i32",
            },
            Case {
                inputs: vec![
                    float_tensor(&[3], vec![0.; 3]),
                    float_tensor(&[1, 3], vec![0.; 3]),
                ],
                error: "expected 2 dims but got shape [3]",
            },
            Case {
                inputs: vec![
                    float_tensor(&[1, 4], vec![0.; 4]),
                    float_tensor(&[1, 3], vec![0.; 3]),
                ],
                error: "expected size 3 for dim 1 but got 4",
            },
            Case {
                inputs: vec![
                    float_tensor(&[1, 3], vec![0.; 3]),
                    float_tensor(&[2, 3], vec![0.; 6]),
                ],
                error: "dim \"batch\" has size 2 but another input has size 1",
            },
        ];

        cases.test_each(|case| {
            let func = compile(test_graph(), &Mode::fast_compile()).unwrap();
            let err = func.run(case.inputs.clone()).err().unwrap();
            assert_eq!(err.kind(), RunErrorKind::InputMismatch);
            assert!(
                err.to_string().contains(case.error),
                "unexpected error {}",
                err
            );
        })
    }

    #[test]
    fn test_output_is_input() {
        // After optimization, the output of `x * 1` is `x` itself.
        let x = Expr::value_with_info("x", DataType::Float, &dims!(2));
        let graph = (x.clone() * 1f32).build_graph(["x"]);
        let func = compile(graph, &Mode::fast_run()).unwrap();
        assert_eq!(func.output_ids(), func.input_ids());

        let input = float_tensor(&[2], vec![3., 4.]);
        let outputs = func.run(vec![input.clone()]).unwrap();
        assert_eq!(outputs, [input]);
    }

    #[test]
    fn test_native_linker_without_kernel() {
        let x = Expr::value("x");
        let graph = x.unary(Transpose { perm: None }).build_graph(["x"]);
        let mode = Mode::none().with_linker(Arc::new(NativeLinker {}));
        let err = compile(graph, &mode).err().unwrap();
        assert!(matches!(
            err,
            CompileError::Link(LinkError::NoNativeKernel { ref op, .. }) if op == "Transpose"
        ));
    }

    #[test]
    fn test_compile_invalid_graph() {
        // The output is an operator rather than a value.
        let mut graph = Graph::new();
        let x = graph.add_value(Some("x"), None, None);
        let y = graph.add_value(Some("y"), None, None);
        let op_id = graph.add_op(
            Some("neg"),
            Arc::new(Elementwise::new(ScalarOp::Neg)),
            &[x],
            &[y],
        );
        graph.set_input_ids(&[x]);
        graph.set_output_ids(&[op_id]);
        let Some(CompileError::Graph(_)) = compile(graph, &Mode::fast_run()).err() else {
            panic!("expected graph error");
        };
    }

    #[test]
    fn test_function_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Function>();
    }

    #[test]
    fn test_debug_print() {
        let func = compile(test_graph(), &Mode::fast_run()).unwrap();
        let printed = func.debug_print();
        assert!(printed.contains("ReduceSum"));
        assert!(printed.contains("FusedElementwise"));
        assert!(printed.contains("[batch]"));
    }
}
