//! Static shape and type inference for whole graphs.
//!
//! [`infer_shapes`] walks a graph in topological order, applying each
//! operator's [`InferShapes`](sten_shape_inference::InferShapes) rule to
//! symbolic descriptions of its inputs. Operators are never executed.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;
use sten_shape_inference::{Constant, InferShapesError, SymExpr, SymTensor, SymbolGen};

use crate::graph::{Dimension, Graph, Node, NodeId, RunError};
use crate::value::{DataType, Value};

/// Maximum length of an int vector constant whose values are tracked
/// symbolically.
const MAX_TRACKED_LEN: usize = 16;

/// Options for [`infer_shapes`].
#[derive(Clone, Debug, Default)]
pub struct InferOptions {
    /// Return an error if an operator's shape rule fails, instead of marking
    /// its outputs as unknown.
    pub strict: bool,
}

/// Error when shape inference fails in strict mode.
#[derive(Clone, Debug, PartialEq)]
pub enum ShapeError {
    /// The shape rule of an operator reported an error.
    Operator {
        /// Name of the operator node.
        node: String,
        error: InferShapesError,
    },

    /// The graph could not be sorted.
    Graph(RunError),
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator { node, error } => {
                write!(f, "shape inference failed for \"{}\": {}", node, error)
            }
            Self::Graph(err) => write!(f, "shape inference failed: {}", err),
        }
    }
}

impl Error for ShapeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Operator { error, .. } => Some(error),
            Self::Graph(err) => Some(err),
        }
    }
}

impl From<RunError> for ShapeError {
    fn from(err: RunError) -> Self {
        Self::Graph(err)
    }
}

/// Inferred symbolic shapes and data types of the values in a graph.
#[derive(Clone, Debug, Default)]
pub struct ShapeMap {
    shapes: FxHashMap<NodeId, SymTensor>,
    dtypes: FxHashMap<NodeId, DataType>,
}

impl ShapeMap {
    pub fn new() -> ShapeMap {
        ShapeMap::default()
    }

    /// Return the symbolic description of a value or constant.
    pub fn get(&self, id: NodeId) -> Option<&SymTensor> {
        self.shapes.get(&id).filter(|t| !t.is_unknown())
    }

    /// Return the shape of a value as graph dimensions.
    ///
    /// Compound size expressions are described by symbolic dimensions named
    /// after the expression, eg. `batch * 4`.
    pub fn dims(&self, id: NodeId) -> Option<Vec<Dimension>> {
        let shape = self.get(id)?.shape()?;
        Some(shape.map(|size| sym_to_dim(&size)).collect())
    }

    /// Return the shape of a value if all of its sizes are known.
    pub fn fixed_shape(&self, id: NodeId) -> Option<Vec<usize>> {
        self.get(id)?.fixed_shape()
    }

    pub fn dtype(&self, id: NodeId) -> Option<DataType> {
        self.dtypes.get(&id).copied()
    }

    /// Return true if two values are known to have the same shape.
    pub fn same_shape(&self, a: NodeId, b: NodeId) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.same_shape(b),
            _ => false,
        }
    }

    /// Return the number of values with a known description.
    pub fn len(&self) -> usize {
        self.shapes.values().filter(|t| !t.is_unknown()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&mut self, id: NodeId, shape: SymTensor, dtype: Option<DataType>) {
        self.shapes.insert(id, shape);
        if let Some(dtype) = dtype {
            self.dtypes.insert(id, dtype);
        }
    }
}

fn sym_to_dim(size: &SymExpr) -> Dimension {
    match size {
        SymExpr::Value(size) if *size >= 0 => Dimension::Fixed(*size as usize),
        SymExpr::Var(sym) => Dimension::Symbolic(sym.name.clone()),
        expr => Dimension::Symbolic(expr.to_string()),
    }
}

/// Symbolic dims are assumed to be `>= 0`, so zero is a valid size.
fn dim_to_sym(dim: &Dimension) -> SymExpr {
    match dim {
        Dimension::Fixed(size) => SymExpr::Value((*size).min(i32::MAX as usize) as i32),
        Dimension::Symbolic(name) => SymExpr::pos_var(name),
    }
}

/// Describe a constant. Small int tensors have their values tracked.
fn constant_info(value: &Value) -> SymTensor {
    if let Value::Int32Tensor(t) = value {
        match t.ndim() {
            0 => return SymTensor::from_constant(&Constant::Scalar(t.data()[0])),
            1 if t.len() <= MAX_TRACKED_LEN => {
                return SymTensor::from_constant(&Constant::Vector(t.data().to_vec()));
            }
            _ => {}
        }
    }
    SymTensor::from_fixed_shape(value.shape())
}

fn declared_info(dims: Option<&[Dimension]>) -> SymTensor {
    match dims {
        Some(dims) => SymTensor::from_shape(dims.iter().map(dim_to_sym).collect()),
        None => SymTensor::unknown("no declared shape"),
    }
}

/// Infer the shapes and types of every value in a graph.
///
/// Graph inputs, and other values without a producer, are described by
/// their declared shapes. Fixed sizes become known values and symbolic
/// dimensions become positive symbols, so that inputs sharing a dimension
/// name share a size.
///
/// Outputs of operators without a shape rule are unknown. If an operator's
/// rule fails, its outputs are unknown unless `opts.strict` is set.
pub fn infer_shapes(graph: &Graph, opts: &InferOptions) -> Result<ShapeMap, ShapeError> {
    let mut shapes = ShapeMap::new();
    let mut sym_gen = SymbolGen::new();

    for (id, node) in graph.iter() {
        match node {
            Node::Constant(constant) => {
                shapes.insert(id, constant_info(constant.value()), node.dtype());
            }
            Node::Value(value) if graph.get_source_node(id).is_none() => {
                shapes.insert(id, declared_info(value.shape()), value.dtype());
            }
            Node::Value(_) | Node::Operator(_) => {}
        }
    }

    for op_id in graph.topological_order()? {
        let Some(Node::Operator(op_node)) = graph.get_node(op_id) else {
            continue;
        };
        let op = op_node.operator();

        let input_shapes: Vec<SymTensor> = op_node
            .input_ids()
            .iter()
            .map(|id| {
                shapes
                    .shapes
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| SymTensor::unknown("missing input"))
            })
            .collect();
        let input_types: Vec<Option<DataType>> = op_node
            .input_ids()
            .iter()
            .map(|id| shapes.dtype(*id))
            .collect();

        let outputs = match op.as_infer_shapes() {
            Some(rule) => match rule.infer_shapes(&input_shapes, &mut sym_gen) {
                Ok(outputs) => outputs,
                Err(error) if opts.strict => {
                    return Err(ShapeError::Operator {
                        node: graph.node_name(op_id),
                        error,
                    });
                }
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        };
        let output_types = op.output_types(&input_types);

        let mut outputs = outputs.into_iter();
        for (i, &output_id) in op_node.output_ids().iter().enumerate() {
            let declared = graph.get_node(output_id);
            let shape = match outputs.next() {
                Some(shape) if !shape.is_unknown() => shape.simplify(),
                _ => declared_info(declared.and_then(|n| match n {
                    Node::Value(v) => v.shape(),
                    _ => None,
                })),
            };
            let dtype = output_types
                .get(i)
                .copied()
                .flatten()
                .or_else(|| declared.and_then(|n| n.dtype()));
            shapes.insert(output_id, shape, dtype);
        }
    }

    Ok(shapes)
}

/// Write inferred shapes and types into the value nodes of a graph.
///
/// Graph inputs keep their declared shapes.
pub fn annotate(graph: &mut Graph, shapes: &ShapeMap) {
    let value_ids: Vec<NodeId> = graph
        .iter()
        .filter(|(id, node)| matches!(node, Node::Value(_)) && !graph.input_ids().contains(id))
        .map(|(id, _)| id)
        .collect();

    for id in value_ids {
        let dims = shapes.dims(id);
        let dtype = shapes.dtype(id);
        if let Some(Node::Value(value)) = graph.get_node_mut(id) {
            if let Some(dims) = dims {
                value.update_shape(dims);
            }
            if let Some(dtype) = dtype {
                value.update_type(dtype);
            }
        }
    }
}
