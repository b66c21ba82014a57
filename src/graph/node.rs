use std::fmt;
use std::sync::Arc;

use super::NodeId;
use crate::operator::Operator;
use crate::value::{DataType, Value};

#[derive(Clone, Debug)]
pub enum Node {
    Operator(OperatorNode),
    Constant(ConstantNode),
    Value(ValueNode),
}

impl Node {
    /// Return the debug name of this node
    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Operator(node) => node.name(),
            Node::Constant(constant) => constant.name(),
            Node::Value(node) => node.name(),
        }
    }

    /// Return the tensor shape associated with this node.
    ///
    /// For constants this is the shape of the tensor. Operator nodes have no
    /// shape. For values (eg. inputs/outputs) this is the declared shape, if
    /// any.
    pub fn shape(&self) -> Option<Vec<Dimension>> {
        match self {
            Node::Operator(_) => None,
            Node::Constant(node) => Some(
                node.value()
                    .shape()
                    .iter()
                    .copied()
                    .map(Dimension::Fixed)
                    .collect(),
            ),
            Node::Value(node) => node.shape().map(|dims| dims.to_vec()),
        }
    }

    /// Return the data type associated with this node.
    ///
    /// - For constants this returns the element type of the tensor
    /// - For values this returns the declared element type, if known
    /// - For operators this always returns `None`.
    pub fn dtype(&self) -> Option<DataType> {
        match self {
            Node::Value(node) => node.dtype,
            Node::Constant(constant) => Some(constant.value().dtype()),
            Node::Operator(_) => None,
        }
    }

    /// Return the contained operator, if this an operator node.
    pub fn as_operator(&self) -> Option<&OperatorNode> {
        match self {
            Node::Operator(op) => Some(op),
            _ => None,
        }
    }

    /// Return the contained constant, if this a constant node.
    pub fn as_constant(&self) -> Option<&ConstantNode> {
        match self {
            Node::Constant(c) => Some(c),
            _ => None,
        }
    }
}

/// Represents the size of a dimension of a runtime-provided value, such as
/// a graph input, output or intermediate value.
#[derive(Clone, PartialEq)]
pub enum Dimension {
    /// A dimension whose size is fixed when the graph is built.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol provides
    /// a name to identify when different values share a size.
    Symbolic(String),
}

impl Dimension {
    pub fn as_fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(size) => Some(*size),
            Self::Symbolic(_) => None,
        }
    }
}

impl From<usize> for Dimension {
    fn from(val: usize) -> Dimension {
        Dimension::Fixed(val)
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Dimension {
        Dimension::Symbolic(name)
    }
}

impl<'a> From<&'a str> for Dimension {
    fn from(name: &'a str) -> Dimension {
        Dimension::Symbolic(name.into())
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => write!(f, "\"{}\"", name),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OperatorNode {
    name: Option<String>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    operator: Arc<dyn Operator + Send + Sync>,
}

impl OperatorNode {
    pub fn new(
        name: Option<&str>,
        input_ids: &[NodeId],
        output_ids: &[NodeId],
        operator: Arc<dyn Operator + Send + Sync>,
    ) -> Self {
        OperatorNode {
            name: name.map(|s| s.to_owned()),
            inputs: input_ids.to_vec(),
            outputs: output_ids.to_vec(),
            operator,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn operator(&self) -> &(dyn Operator + Send + Sync) {
        self.operator.as_ref()
    }

    /// Return a new `Arc` reference to this node's operator.
    ///
    /// Operators are immutable once added to a graph, so they can be shared
    /// between graphs.
    pub fn clone_operator(&self) -> Arc<dyn Operator + Send + Sync> {
        self.operator.clone()
    }

    /// Replace an input in the operator's list of inputs.
    ///
    /// Consumers outside the graph module should use graph-level methods
    /// instead, which update edge caches.
    pub(super) fn replace_input(&mut self, old_id: NodeId, new_id: NodeId) {
        for input_id in self.inputs.iter_mut() {
            if *input_id == old_id {
                *input_id = new_id;
            }
        }
    }

    pub(super) fn set_operator(&mut self, operator: Arc<dyn Operator + Send + Sync>) {
        self.operator = operator;
    }

    pub(super) fn set_input_ids(&mut self, input_ids: &[NodeId]) {
        self.inputs = input_ids.to_vec();
    }
}

#[derive(Clone, Debug)]
pub struct ValueNode {
    name: Option<String>,
    shape: Option<Vec<Dimension>>,
    dtype: Option<DataType>,
}

impl ValueNode {
    pub fn new(name: Option<&str>, shape: Option<Vec<Dimension>>, dtype: Option<DataType>) -> Self {
        ValueNode {
            name: name.map(|s| s.to_owned()),
            shape,
            dtype,
        }
    }

    /// Return the number of dimensions in this value, if it has shape information.
    pub fn ndim(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }

    pub fn shape(&self) -> Option<&[Dimension]> {
        self.shape.as_deref()
    }

    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    pub fn update_shape(&mut self, shape: Vec<Dimension>) {
        self.shape = Some(shape);
    }

    pub fn update_type(&mut self, dtype: DataType) {
        self.dtype = Some(dtype);
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A tensor whose value is known when the graph is built.
#[derive(Clone, Debug)]
pub struct ConstantNode {
    name: Option<String>,
    value: Value,
}

impl ConstantNode {
    pub fn new(name: Option<&str>, value: Value) -> Self {
        ConstantNode {
            name: name.map(|s| s.to_owned()),
            value,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Return the value of a constant with a single element, as a float.
    pub fn as_scalar(&self) -> Option<f32> {
        self.value.as_scalar()
    }
}
