//! Tools to simplify building graphs.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;
use std::sync::Arc;

use crate::graph::{Dimension, Graph, NodeId};
use crate::operator::Operator;
use crate::ops::{Elementwise, ScalarOp};
use crate::value::{DataType, Value};

enum ExprKind {
    /// Expression representing a value node.
    Value(ValueExpr),
    /// Expression representing a constant node.
    Constant(Value),
    /// Expression representing an operator node.
    Operator(OperatorExpr),
    /// Expression representing a specific output of an operator node.
    OperatorOutput(OperatorOutputExpr),
}

/// An expression describing a [`Graph`].
///
/// Expressions are constructed using constructor methods and math operators.
/// They are then converted into a graph using [`Expr::build_graph`] or
/// [`Expr::make_graph`].
///
/// The following builds a graph for `log(1 + exp(x)) * 2`:
///
/// ```
/// use sten::graph::builder::Expr;
/// use sten::ops::{Elementwise, ScalarOp};
///
/// let x = Expr::value("x");
/// let expr = (Expr::constant(1f32) + x.unary(Elementwise::new(ScalarOp::Exp)))
///     .unary(Elementwise::new(ScalarOp::Log))
///     * 2f32;
/// let graph = expr.build_graph(["x"]);
/// assert_eq!(graph.input_ids().len(), 1);
/// assert_eq!(graph.operator_count(), 4);
/// ```
#[derive(Clone)]
pub struct Expr {
    kind: Rc<ExprKind>,
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Expr {
        Expr { kind: kind.into() }
    }
}

impl Expr {
    /// Create an expression representing a runtime-computed value (eg. graph
    /// inputs).
    pub fn value(name: &str) -> Expr {
        Expr::from(ExprKind::Value(ValueExpr {
            name: name.to_string(),
            dtype: None,
            shape: None,
        }))
    }

    /// Create an expression representing a runtime-computed value with
    /// shape and dtype information.
    pub fn value_with_info(name: &str, dtype: DataType, shape: &[Dimension]) -> Expr {
        Expr::from(ExprKind::Value(ValueExpr {
            name: name.to_string(),
            dtype: Some(dtype),
            shape: Some(shape.to_vec()),
        }))
    }

    /// Create an expression representing a constant value.
    pub fn constant<V>(value: V) -> Expr
    where
        V: Into<Value>,
    {
        Expr::from(ExprKind::Constant(value.into()))
    }

    /// Create an expression which applies a unary operator to this expression.
    pub fn unary<Op: Operator + Send + Sync>(&self, op: Op) -> Expr {
        self.apply(op, &[])
    }

    /// Create an expression which applies a binary operator to this expression.
    pub fn binary<Op: Operator + Send + Sync>(&self, op: Op, rhs: Expr) -> Expr {
        self.apply(op, &[rhs])
    }

    /// Create an expression which applies an operator to this expression
    /// and `operands`.
    pub fn apply<Op: Operator + Send + Sync>(&self, op: Op, operands: &[Expr]) -> Expr {
        let mut inputs: Vec<_> = [self.clone()].into();
        inputs.extend(operands.iter().cloned());
        Self::call(Arc::new(op), inputs)
    }

    /// Create an expression which applies an operator to a list of inputs.
    pub fn call(op: Arc<dyn Operator + Send + Sync>, inputs: Vec<Expr>) -> Expr {
        let num_outputs = op.num_outputs().max(1);
        Expr::from(ExprKind::Operator(OperatorExpr {
            op,
            inputs,
            num_outputs,
        }))
    }

    /// Create an expression which refers to the index'th output of the `self`
    /// operator expression, if it has one.
    pub fn output(&self, index: usize) -> Option<Expr> {
        let ExprKind::Operator(op_info) = self.kind.as_ref() else {
            return None;
        };
        if index >= op_info.num_outputs {
            return None;
        }
        Some(Expr::from(ExprKind::OperatorOutput(OperatorOutputExpr {
            op: self.clone(),
            output_index: index,
        })))
    }

    /// Convert this expression into a graph.
    ///
    /// The inputs of the graph are values with names listed in `inputs`.
    /// Names which do not appear in the expression are ignored. The output is
    /// the node that corresponds to the result of the `self` expression.
    pub fn build_graph<'a, I: AsRef<[&'a str]>>(self, inputs: I) -> Graph {
        let mut graph = Graph::new();
        let mut expr_output_ids = HashMap::new();
        let mut name_gen = NodeNameGenerator::new();
        let output_ids = self.add_to_graph(&mut graph, &mut name_gen, &mut expr_output_ids);

        let input_ids: Vec<NodeId> = inputs
            .as_ref()
            .iter()
            .filter_map(|name| graph.get_node_id(name))
            .collect();
        graph.set_input_ids(&input_ids);
        graph.set_output_ids(&output_ids);

        graph
    }

    /// Create a graph with the given inputs and outputs.
    pub fn make_graph<I: AsRef<[Expr]>, O: AsRef<[Expr]>>(inputs: I, outputs: O) -> Graph {
        let mut graph = Graph::new();
        let mut expr_output_ids = HashMap::new();
        let mut name_gen = NodeNameGenerator::new();

        let extend_unique = |output: &mut Vec<NodeId>, new_ids: Vec<NodeId>| {
            for id in new_ids {
                if !output.contains(&id) {
                    output.push(id);
                }
            }
        };

        // Inputs are added first so that they get the names they were given,
        // rather than names deduplicated against intermediate nodes.
        let mut input_ids = Vec::new();
        for input in inputs.as_ref() {
            let new_input_ids = input.add_to_graph(&mut graph, &mut name_gen, &mut expr_output_ids);
            extend_unique(&mut input_ids, new_input_ids);
        }

        let mut output_ids = Vec::new();
        for output in outputs.as_ref() {
            let new_output_ids =
                output.add_to_graph(&mut graph, &mut name_gen, &mut expr_output_ids);
            extend_unique(&mut output_ids, new_output_ids);
        }

        graph.set_input_ids(&input_ids);
        graph.set_output_ids(&output_ids);

        graph
    }

    fn add_to_graph(
        &self,
        graph: &mut Graph,
        name_gen: &mut NodeNameGenerator,
        expr_output_ids: &mut HashMap<ExprRef, Vec<NodeId>>,
    ) -> Vec<NodeId> {
        if let Some(node_ids) = expr_output_ids.get(&ExprRef(self.clone())) {
            return node_ids.clone();
        }

        let output_ids: Vec<NodeId> = match self.kind.as_ref() {
            ExprKind::Value(value_info) => {
                let name = name_gen.generate(&value_info.name);
                [graph.add_value(
                    Some(name.as_str()),
                    value_info.shape.clone(),
                    value_info.dtype,
                )]
                .into()
            }
            ExprKind::Constant(value) => {
                let name = name_gen.generate("const");
                [graph.add_constant(Some(name.as_str()), value.clone())].into()
            }
            ExprKind::Operator(op_info) => {
                let op_inputs: Vec<NodeId> = op_info
                    .inputs
                    .iter()
                    .flat_map(|input_expr| {
                        input_expr.add_to_graph(graph, name_gen, expr_output_ids)
                    })
                    .collect();

                let op_name = name_gen.generate(op_info.op.name());
                let op_outputs: Vec<NodeId> = (0..op_info.num_outputs)
                    .map(|_| {
                        let output_name = name_gen.generate(&format!("{}_out", op_name));
                        graph.add_value(Some(output_name.as_str()), None, None)
                    })
                    .collect();

                graph.add_op(
                    Some(op_name.as_str()),
                    op_info.op.clone(),
                    &op_inputs,
                    &op_outputs,
                );

                op_outputs
            }
            ExprKind::OperatorOutput(output_info) => {
                let output_ids = output_info
                    .op
                    .add_to_graph(graph, name_gen, expr_output_ids);
                output_ids
                    .get(output_info.output_index)
                    .copied()
                    .into_iter()
                    .collect()
            }
        };
        expr_output_ids.insert(ExprRef(self.clone()), output_ids.clone());

        output_ids
    }
}

/// Wrapper around an `Expr` which uses reference-equality.
struct ExprRef(Expr);

impl PartialEq for ExprRef {
    fn eq(&self, other: &ExprRef) -> bool {
        Rc::ptr_eq(&self.0.kind, &other.0.kind)
    }
}

impl Eq for ExprRef {}

impl Hash for ExprRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0.kind).hash(state)
    }
}

struct OperatorExpr {
    op: Arc<dyn Operator + Send + Sync>,
    inputs: Vec<Expr>,
    num_outputs: usize,
}

struct ValueExpr {
    name: String,
    dtype: Option<DataType>,
    shape: Option<Vec<Dimension>>,
}

struct OperatorOutputExpr {
    op: Expr,
    output_index: usize,
}

struct NodeNameGenerator {
    used_names: HashSet<String>,
}

impl NodeNameGenerator {
    fn new() -> NodeNameGenerator {
        NodeNameGenerator {
            used_names: HashSet::new(),
        }
    }

    fn generate(&mut self, prefix: &str) -> String {
        let mut name = prefix.to_string();
        let mut suffix = 0;
        while self.used_names.contains(&name) {
            suffix += 1;
            name = format!("{}_{}", prefix, suffix);
        }
        self.used_names.insert(name.clone());
        name
    }
}

macro_rules! impl_binary_op {
    ($op_trait:ident, $op_method:ident, $scalar_op: ident) => {
        impl $op_trait for Expr {
            type Output = Expr;

            fn $op_method(self, rhs: Expr) -> Expr {
                self.binary(Elementwise::new(ScalarOp::$scalar_op), rhs)
            }
        }

        impl<V> $op_trait<V> for Expr
        where
            V: Into<Value>,
        {
            type Output = Expr;

            fn $op_method(self, rhs: V) -> Expr {
                self.binary(Elementwise::new(ScalarOp::$scalar_op), Expr::constant(rhs))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);
impl_binary_op!(Sub, sub, Sub);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.unary(Elementwise::new(ScalarOp::Neg))
    }
}

/// Create a [`Dimension`] array from a list of symbolic names and fixed sizes.
#[cfg(test)]
macro_rules! dims {
    ($($x:expr),* $(,)?) => {
        [$($crate::graph::Dimension::from($x)),*]
    };
}
#[cfg(test)]
pub(crate) use dims;
