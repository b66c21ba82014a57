//! Linkers bind the operators of a graph to executable implementations.
//!
//! Linking turns a graph into a [`Program`]: an ordered list of steps, each
//! of which executes one operator node using one of several [`Strategy`]s.
//! The [`Linker`] decides the strategy for each node.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::graph::{Graph, NodeId, OperatorNode, RunError};
use crate::infer_shapes::{infer_shapes, InferOptions, ShapeError};
use crate::operator::{InputList, OpError, Operator, OutputList};
use crate::value::Value;

mod debug;
mod program;

pub use program::{Program, RunOptions};

/// A specialized implementation of an operator.
///
/// Kernels are created by [`Operator::native_kernel`] when a graph is
/// linked. Any preparation, such as compiling a fused expression, happens
/// when the kernel is created rather than on each run.
pub trait Kernel: Send + Sync {
    /// Return the name of the operator this kernel implements.
    fn name(&self) -> &str;

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError>;

    /// Return true if this kernel supports [`run_in_place`](Kernel::run_in_place).
    fn can_run_in_place(&self) -> bool {
        false
    }

    /// Execute this kernel, overwriting the first input. `other` contains the
    /// remaining inputs.
    fn run_in_place(
        &self,
        #[allow(unused)] input: Value,
        #[allow(unused)] other: &InputList,
    ) -> Result<Value, OpError> {
        Err(OpError::InvalidValue("In-place execution not supported"))
    }
}

/// How a program step is executed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Strategy {
    /// The operator's reference implementation, [`Operator::run`].
    Interpreted,

    /// A specialized kernel from [`Operator::native_kernel`].
    Native,

    /// Both implementations, with results compared.
    Checked,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interpreted => "interpreted",
            Self::Native => "native",
            Self::Checked => "checked",
        };
        write!(f, "{}", name)
    }
}

enum ThunkKind {
    Interpreted,
    Native(Box<dyn Kernel>),
    Checked(Option<Box<dyn Kernel>>),
}

/// An operator bound to the implementation that will execute it.
pub struct Thunk {
    op: Arc<dyn Operator + Send + Sync>,
    kind: ThunkKind,
}

impl Thunk {
    pub fn interpreted(op: Arc<dyn Operator + Send + Sync>) -> Thunk {
        Thunk {
            op,
            kind: ThunkKind::Interpreted,
        }
    }

    pub fn native(op: Arc<dyn Operator + Send + Sync>, kernel: Box<dyn Kernel>) -> Thunk {
        Thunk {
            op,
            kind: ThunkKind::Native(kernel),
        }
    }

    /// Create a thunk which runs the reference implementation and, if
    /// provided, the native kernel, and checks that they agree.
    pub fn checked(op: Arc<dyn Operator + Send + Sync>, kernel: Option<Box<dyn Kernel>>) -> Thunk {
        Thunk {
            op,
            kind: ThunkKind::Checked(kernel),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self.kind {
            ThunkKind::Interpreted => Strategy::Interpreted,
            ThunkKind::Native(_) => Strategy::Native,
            ThunkKind::Checked(_) => Strategy::Checked,
        }
    }

    pub fn operator(&self) -> &(dyn Operator + Send + Sync) {
        self.op.as_ref()
    }

    /// Return true if this step may overwrite its first input.
    ///
    /// Checked steps never run in place, since both implementations need
    /// the original inputs.
    pub fn can_run_in_place(&self) -> bool {
        match &self.kind {
            ThunkKind::Interpreted => self.op.can_run_in_place(),
            ThunkKind::Native(kernel) => kernel.can_run_in_place(),
            ThunkKind::Checked(_) => false,
        }
    }

    pub fn is_commutative(&self) -> bool {
        self.op.is_commutative()
    }

    /// Run the implementation selected for this thunk.
    ///
    /// For checked thunks this runs the reference implementation only. See
    /// [`Thunk::native_kernel`].
    pub fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        match &self.kind {
            ThunkKind::Native(kernel) => kernel.run(inputs),
            ThunkKind::Interpreted | ThunkKind::Checked(_) => self.op.run(inputs),
        }
    }

    pub fn run_in_place(&self, input: Value, other: &InputList) -> Result<Value, OpError> {
        match &self.kind {
            ThunkKind::Native(kernel) => kernel.run_in_place(input, other),
            ThunkKind::Interpreted | ThunkKind::Checked(_) => self.op.run_in_place(input, other),
        }
    }

    /// Return the kernel that a checked thunk compares against.
    pub(crate) fn checked_kernel(&self) -> Option<&dyn Kernel> {
        match &self.kind {
            ThunkKind::Checked(kernel) => kernel.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("op", &self.op.name())
            .field("strategy", &self.strategy())
            .finish()
    }
}

/// Errors when linking a graph.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkError {
    /// The linker requires a native kernel, but the operator has none.
    NoNativeKernel {
        /// Name of the operator node.
        node: String,
        /// Name of the operator, eg. `Concat`.
        op: String,
    },

    /// An execution plan could not be created.
    Planning(RunError),

    /// Shape inference for runtime checks failed.
    Shape(ShapeError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoNativeKernel { node, op } => {
                write!(f, "no native kernel for operator {} (node \"{}\")", op, node)
            }
            Self::Planning(err) => write!(f, "link failed: {}", err),
            Self::Shape(err) => write!(f, "link failed: {}", err),
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NoNativeKernel { .. } => None,
            Self::Planning(err) => Some(err),
            Self::Shape(err) => Some(err),
        }
    }
}

impl From<RunError> for LinkError {
    fn from(err: RunError) -> Self {
        Self::Planning(err)
    }
}

impl From<ShapeError> for LinkError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

/// Chooses how each operator in a graph is executed.
pub trait Linker: fmt::Debug + Send + Sync {
    /// Return the name used to select this linker, eg. `hybrid`.
    fn name(&self) -> &str;

    /// Bind an operator node to an implementation.
    fn bind(
        &self,
        graph: &Graph,
        op_id: NodeId,
        op_node: &OperatorNode,
    ) -> Result<Thunk, LinkError>;

    /// Return true if intermediate values are freed as soon as they are no
    /// longer needed.
    fn gc(&self) -> bool {
        true
    }

    /// Return true if programs check the shapes of runtime values against
    /// static shape inference.
    fn check_shapes(&self) -> bool {
        false
    }

    /// Create a program which computes `outputs` from `inputs`.
    fn link(
        &self,
        graph: &Graph,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<Program, LinkError> {
        let plan = graph.execution_plan(inputs, outputs)?;
        let mut steps = Vec::with_capacity(plan.len());
        for op_id in plan {
            let Some(op_node) = graph.get_node(op_id).and_then(|n| n.as_operator()) else {
                return Err(RunError::invalid_node_id().into());
            };
            steps.push((op_id, self.bind(graph, op_id, op_node)?));
        }

        let shapes = if self.check_shapes() {
            Some(infer_shapes(graph, &InferOptions::default())?)
        } else {
            None
        };

        Ok(Program::new(
            graph.clone(),
            inputs,
            outputs,
            steps,
            self.gc(),
            shapes,
        ))
    }
}

/// Runs every operator with its reference implementation.
#[derive(Clone, Debug, Default)]
pub struct InterpretedLinker {}

impl Linker for InterpretedLinker {
    fn name(&self) -> &str {
        "interpreted"
    }

    fn bind(&self, _graph: &Graph, _op_id: NodeId, op_node: &OperatorNode) -> Result<Thunk, LinkError> {
        Ok(Thunk::interpreted(op_node.clone_operator()))
    }
}

/// Runs every operator with a native kernel, failing to link graphs with
/// operators that have none.
#[derive(Clone, Debug, Default)]
pub struct NativeLinker {}

impl Linker for NativeLinker {
    fn name(&self) -> &str {
        "native"
    }

    fn bind(&self, graph: &Graph, op_id: NodeId, op_node: &OperatorNode) -> Result<Thunk, LinkError> {
        match op_node.operator().native_kernel() {
            Some(kernel) => Ok(Thunk::native(op_node.clone_operator(), kernel)),
            None => Err(LinkError::NoNativeKernel {
                node: graph.node_name(op_id),
                op: op_node.operator().name().to_string(),
            }),
        }
    }
}

/// Uses native kernels where available and reference implementations
/// otherwise.
#[derive(Clone, Debug)]
pub struct HybridLinker {
    pub gc: bool,
}

impl Default for HybridLinker {
    fn default() -> Self {
        HybridLinker { gc: true }
    }
}

impl Linker for HybridLinker {
    fn name(&self) -> &str {
        if self.gc {
            "hybrid"
        } else {
            "hybrid_nogc"
        }
    }

    fn bind(&self, _graph: &Graph, _op_id: NodeId, op_node: &OperatorNode) -> Result<Thunk, LinkError> {
        let op = op_node.clone_operator();
        Ok(match op.native_kernel() {
            Some(kernel) => Thunk::native(op, kernel),
            None => Thunk::interpreted(op),
        })
    }

    fn gc(&self) -> bool {
        self.gc
    }
}

/// Runs the reference and native implementations of each operator and
/// fails if their outputs differ, or if the shapes of values differ from
/// static shape inference.
#[derive(Clone, Debug, Default)]
pub struct DebugLinker {}

impl Linker for DebugLinker {
    fn name(&self) -> &str {
        "debug"
    }

    fn bind(&self, _graph: &Graph, _op_id: NodeId, op_node: &OperatorNode) -> Result<Thunk, LinkError> {
        let op = op_node.clone_operator();
        let kernel = op.native_kernel();
        Ok(Thunk::checked(op, kernel))
    }

    fn check_shapes(&self) -> bool {
        true
    }
}

/// Create a linker from its name.
///
/// Names are `interpreted`, `native`, `hybrid`, `hybrid_nogc` and `debug`.
pub fn linker_from_name(name: &str) -> Option<Arc<dyn Linker>> {
    let linker: Arc<dyn Linker> = match name {
        "interpreted" => Arc::new(InterpretedLinker {}),
        "native" => Arc::new(NativeLinker {}),
        "hybrid" => Arc::new(HybridLinker { gc: true }),
        "hybrid_nogc" => Arc::new(HybridLinker { gc: false }),
        "debug" => Arc::new(DebugLinker {}),
        _ => return None,
    };
    Some(linker)
}
