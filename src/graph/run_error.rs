use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::operator::OpError;
use crate::value::ValueMeta;

/// Errors that occur when planning or running a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct RunError(RunErrorImpl);

impl RunError {
    /// Name of the graph node that this error relates to, if any.
    pub fn node_name(&self) -> Option<&str> {
        self.0.node_name()
    }

    /// Return the general category of error.
    pub fn kind(&self) -> RunErrorKind {
        self.0.kind()
    }

    pub(crate) fn invalid_node_id() -> Self {
        RunErrorImpl::InvalidNodeId.into()
    }

    pub(crate) fn planning_error(message: String) -> Self {
        RunErrorImpl::PlanningError(message).into()
    }

    pub(crate) fn op_error(name: &str, error: OpError, inputs: Vec<ValueMeta>) -> Self {
        RunErrorImpl::OperatorError {
            name: name.to_string(),
            error,
            inputs,
        }
        .into()
    }

    pub(crate) fn output_mismatch(name: &str, error: String) -> Self {
        RunErrorImpl::OutputMismatch {
            name: name.to_string(),
            error,
        }
        .into()
    }

    pub(crate) fn input_mismatch(name: &str, error: String) -> Self {
        RunErrorImpl::InputMismatch {
            name: name.to_string(),
            error,
        }
        .into()
    }

    pub(crate) fn debug_mismatch(name: &str, error: String) -> Self {
        RunErrorImpl::DebugMismatch {
            name: name.to_string(),
            error,
        }
        .into()
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Error for RunError {}

impl From<RunErrorImpl> for RunError {
    fn from(inner: RunErrorImpl) -> Self {
        Self(inner)
    }
}

/// The category of graph execution error. See [`RunError::kind`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum RunErrorKind {
    /// An input or output node was not found.
    NodeNotFound,
    /// Failed to construct an execution plan that would generate the requested
    /// outputs from the inputs.
    PlanningError,
    /// An error occurred when running an operator.
    OperatorError,
    /// A value passed to a compiled function does not match the declared
    /// type or shape of the input.
    InputMismatch,
    /// Two implementations of an operator produced different results.
    DebugMismatch,
}

#[derive(Clone, Debug, PartialEq)]
enum RunErrorImpl {
    /// An input or output node ID is invalid
    InvalidNodeId,

    /// A plan could not be constructed that would generate the requested output
    /// from the input.
    PlanningError(String),

    /// Execution of an operator failed
    OperatorError {
        /// Name of the operator node.
        name: String,
        error: OpError,

        /// Shape and dtype of operator inputs.
        inputs: Vec<ValueMeta>,
    },

    /// The outputs of an operator did not match expectations (eg. the number
    /// of outputs was wrong).
    OutputMismatch { name: String, error: String },

    /// A function input has the wrong type or shape.
    InputMismatch {
        /// Name of the input.
        name: String,
        error: String,
    },

    /// Outputs or shapes checked by the debug linker differ.
    DebugMismatch { name: String, error: String },
}

impl RunErrorImpl {
    fn kind(&self) -> RunErrorKind {
        type Kind = RunErrorKind;

        match self {
            Self::InvalidNodeId => Kind::NodeNotFound,
            Self::PlanningError(_) => Kind::PlanningError,
            Self::OperatorError { .. } | Self::OutputMismatch { .. } => Kind::OperatorError,
            Self::InputMismatch { .. } => Kind::InputMismatch,
            Self::DebugMismatch { .. } => Kind::DebugMismatch,
        }
    }

    fn node_name(&self) -> Option<&str> {
        match self {
            Self::InvalidNodeId | Self::PlanningError(_) => None,
            Self::OperatorError { name, .. }
            | Self::OutputMismatch { name, .. }
            | Self::InputMismatch { name, .. }
            | Self::DebugMismatch { name, .. } => Some(name),
        }
    }
}

impl Display for RunErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNodeId => write!(f, "node ID is invalid"),
            Self::PlanningError(err) => write!(f, "planning error: {}", err),
            Self::OperatorError {
                name,
                error: err,
                inputs,
            } => {
                write!(f, "operator \"{}\" failed: {}. Inputs were (", name, err)?;
                for (i, input) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", input)?;
                }
                write!(f, ")")
            }
            Self::OutputMismatch { name, error } => {
                write!(f, "operator \"{}\" output mismatch: {}", name, error)
            }
            Self::InputMismatch { name, error } => {
                write!(f, "input \"{}\" mismatch: {}", name, error)
            }
            Self::DebugMismatch { name, error } => {
                write!(f, "debug check failed for \"{}\": {}", name, error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RunError, RunErrorKind};
    use crate::operator::OpError;
    use crate::value::{DataType, ValueMeta};

    #[test]
    fn test_run_error_display() {
        let err = RunError::op_error(
            "add",
            OpError::IncompatibleInputShapes("cannot broadcast"),
            vec![
                ValueMeta {
                    dtype: DataType::Float,
                    shape: vec![2, 3],
                },
                ValueMeta {
                    dtype: DataType::Float,
                    shape: vec![4],
                },
            ],
        );
        assert_eq!(err.kind(), RunErrorKind::OperatorError);
        assert_eq!(err.node_name(), Some("add"));
        assert_eq!(
            err.to_string(),
            "operator \"add\" failed: incompatible input shapes: cannot broadcast. Inputs were (f32 [2, 3], f32 [4])"
        );

        let err = RunError::input_mismatch("x", "expected 2 dims".into());
        assert_eq!(err.kind(), RunErrorKind::InputMismatch);
        assert_eq!(err.to_string(), "input \"x\" mismatch: expected 2 dims");
    }
}
