//! The [`Operator`] trait for defining operators.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};

use smallvec::SmallVec;
use sten_shape_inference::InferShapes;

use crate::link::Kernel;
use crate::value::{DataType, TryFromValueError, Value};

/// Possible reasons why an operator may fail on a given input.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum OpError {
    /// Casting a tensor to an expected type failed.
    CastFailed(TryFromValueError),

    /// Casting an input to an expected type failed.
    InputCastFailed {
        index: usize,
        error: TryFromValueError,
    },

    /// A tensor has an unsupported type.
    UnsupportedType,

    /// Input tensor shapes are not compatible with each other or operator
    /// attributes.
    IncompatibleInputShapes(&'static str),

    /// The number of inputs was less than the required number.
    MissingInputs,

    /// An input has a value that is incorrect.
    InvalidValue(&'static str),

    /// A runtime assertion in the graph failed.
    AssertionFailed(String),
}

impl OpError {
    /// Associate this error with a given operator input.
    pub fn with_input_index(self, index: usize) -> OpError {
        match self {
            Self::CastFailed(error) => OpError::InputCastFailed { index, error },
            Self::InputCastFailed { error, .. } => OpError::InputCastFailed { index, error },
            other => other,
        }
    }
}

impl From<TryFromValueError> for OpError {
    fn from(val: TryFromValueError) -> OpError {
        OpError::CastFailed(val)
    }
}

impl Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::CastFailed(err) => write!(f, "{}", err),
            OpError::InputCastFailed { index, error } => {
                write!(f, "conversion error for input {}: {}", index, error)
            }
            OpError::IncompatibleInputShapes(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            OpError::MissingInputs => write!(f, "required inputs were missing"),
            OpError::InvalidValue(details) => {
                write!(f, "input or attribute has invalid value: {}", details)
            }
            OpError::UnsupportedType => {
                write!(f, "unsupported input type")
            }
            OpError::AssertionFailed(message) => write!(f, "assertion failed: {}", message),
        }
    }
}

impl Error for OpError {}

/// Outputs from an operator.
///
/// This avoids allocations in the common case where an operator produces
/// exactly one output.
pub type OutputList = SmallVec<[Value; 1]>;

/// Data types of an operator's outputs. `None` entries are unknown.
pub type OutputTypeList = SmallVec<[Option<DataType>; 1]>;

/// An Operator performs a computation step when executing a dataflow graph.
///
/// Operators take zero or more input values, plus a set of static
/// attributes, and produce one or more output values.
pub trait Operator: Any + Debug {
    /// Return a display name for the operator.
    ///
    /// Rewrite patterns identify operators by name.
    fn name(&self) -> &str;

    /// Execute the operator using its reference implementation.
    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError>;

    /// Return the maximum number of inputs this operator accepts.
    ///
    /// This can return `None` for variadic inputs with no limit.
    fn max_inputs(&self) -> Option<usize>;

    /// Return the number of outputs this operator produces.
    fn num_outputs(&self) -> usize {
        1
    }

    /// Return true if this operator supports in-place execution via
    /// `run_in_place`. The first input is the one overwritten.
    fn can_run_in_place(&self) -> bool {
        false
    }

    /// Return true if this operator is commutative, meaning that its inputs
    /// can be re-ordered without affecting the result.
    fn is_commutative(&self) -> bool {
        false
    }

    /// Return true if this operator's outputs depend only on its inputs.
    fn is_deterministic(&self) -> bool {
        true
    }

    /// Execute this operator in-place on an existing tensor.
    ///
    /// `input` is the first input, which the implementation may modify and
    /// return as the output. `other` contains the remaining inputs.
    fn run_in_place(
        &self,
        #[allow(unused)] input: Value,
        #[allow(unused)] other: &InputList,
    ) -> Result<Value, OpError> {
        Err(OpError::InvalidValue("In-place execution not supported"))
    }

    /// Return the shape inference rule for this operator.
    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        None
    }

    /// Return the data types of outputs given the types of inputs.
    ///
    /// The default implementation assumes every output has the type of the
    /// first input.
    fn output_types(&self, input_types: &[Option<DataType>]) -> OutputTypeList {
        let dtype = input_types.first().copied().flatten();
        (0..self.num_outputs()).map(|_| dtype).collect()
    }

    /// Return a specialized implementation of this operator, if it has one.
    ///
    /// Native kernels are prepared once when a graph is linked, and may
    /// parallelize work.
    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        None
    }

    /// Return true if `other` is the same operator with the same attributes,
    /// so that applying both to the same inputs gives the same outputs.
    fn same_op(&self, #[allow(unused)] other: &dyn Operator) -> bool {
        false
    }
}

impl dyn Operator {
    /// Downcast this operator to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

impl dyn Operator + Send + Sync {
    /// Downcast this operator to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

/// Implementation of [`Operator::same_op`] for operators whose attributes
/// are compared with `PartialEq`.
pub(crate) fn same_op_by_eq<T: Operator + PartialEq>(op: &T, other: &dyn Operator) -> bool {
    other.downcast_ref::<T>() == Some(op)
}

/// Convenience methods that make it easier to run operators in tests.
#[cfg(test)]
pub trait OperatorExt: Operator {
    /// Run an operator and extract the first output as a tensor with a given
    /// type.
    fn run_simple<'a, I: Into<InputList<'a>>, O: TryFrom<Value>>(
        &self,
        inputs: I,
    ) -> Result<O, OpError>
    where
        OpError: From<<O as TryFrom<Value>>::Error>,
    {
        let inputs = inputs.into();
        let mut outputs = self.run(&inputs)?;
        Ok(outputs.remove(0).try_into()?)
    }

    /// Run an operator with a mutable input and extract the output.
    fn run_simple_in_place<'a, M: Into<Value>, I: Into<InputList<'a>>, O: TryFrom<Value>>(
        &self,
        mut_input: M,
        inputs: I,
    ) -> Result<O, OpError>
    where
        OpError: From<<O as TryFrom<Value>>::Error>,
    {
        let inputs: InputList = inputs.into();
        let inputs = inputs.with_first_input_omitted(true);
        let output = self.run_in_place(mut_input.into(), &inputs)?;
        Ok(output.try_into()?)
    }
}

#[cfg(test)]
impl<O: ?Sized + Operator> OperatorExt for O {}

/// List of inputs for an operator evaluation.
///
/// This is a borrowed collection of [`Value`]s with methods to conveniently
/// extract inputs and produce appropriate errors if inputs are missing or of
/// the wrong type.
#[derive(Clone, Default)]
pub struct InputList<'a> {
    inputs: SmallVec<[&'a Value; 4]>,

    /// True if the input list does not contain the first operator input because
    /// it is being passed separately. In this case input indices are offset by
    /// one in errors.
    first_input_omitted: bool,
}

impl<'a> InputList<'a> {
    /// Construct an empty input list.
    pub fn new() -> InputList<'a> {
        InputList::default()
    }

    pub fn from(inputs: &[&'a Value]) -> InputList<'a> {
        InputList {
            inputs: SmallVec::from_slice(inputs),
            first_input_omitted: false,
        }
    }

    /// Mark this input list as not containing the first input to the operator.
    ///
    /// This is used together with [`Operator::run_in_place`] where the first
    /// input is passed separately.
    pub fn with_first_input_omitted(mut self, omitted: bool) -> Self {
        self.first_input_omitted = omitted;
        self
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn push(&mut self, input: &'a Value) {
        self.inputs.push(input)
    }

    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.inputs.get(index).copied()
    }

    /// Get a required operator input.
    pub fn require(&self, index: usize) -> Result<&'a Value, OpError> {
        self.get(index).ok_or(OpError::MissingInputs)
    }

    /// Convert a required input into a tensor reference of a given type.
    pub fn require_as<T>(&self, index: usize) -> Result<T, OpError>
    where
        T: TryFrom<&'a Value, Error = TryFromValueError>,
    {
        self.require(index).and_then(|input| {
            input.try_into().map_err(|error| OpError::InputCastFailed {
                index: self.to_real_index(index),
                error,
            })
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.inputs.iter().copied()
    }

    /// Map an index into this input list back to an index in the full
    /// sequence of operator inputs.
    fn to_real_index(&self, index: usize) -> usize {
        if self.first_input_omitted {
            index + 1
        } else {
            index
        }
    }
}

impl<'a> From<&'a Value> for InputList<'a> {
    fn from(val: &'a Value) -> InputList<'a> {
        InputList::from(&[val])
    }
}

impl<'a> From<()> for InputList<'a> {
    fn from(_: ()) -> InputList<'a> {
        Self::default()
    }
}

impl<'a> From<(&'a Value,)> for InputList<'a> {
    fn from((a,): (&'a Value,)) -> InputList<'a> {
        InputList::from(&[a])
    }
}

impl<'a> From<(&'a Value, &'a Value)> for InputList<'a> {
    fn from((a, b): (&'a Value, &'a Value)) -> InputList<'a> {
        InputList::from(&[a, b])
    }
}

impl<'a> From<(&'a Value, &'a Value, &'a Value)> for InputList<'a> {
    fn from((a, b, c): (&'a Value, &'a Value, &'a Value)) -> InputList<'a> {
        InputList::from(&[a, b, c])
    }
}

impl<'a> Extend<&'a Value> for InputList<'a> {
    fn extend<T: IntoIterator<Item = &'a Value>>(&mut self, iter: T) {
        self.inputs.extend(iter)
    }
}

impl<'a> FromIterator<&'a Value> for InputList<'a> {
    fn from_iter<T: IntoIterator<Item = &'a Value>>(iter: T) -> Self {
        let mut list = InputList::new();
        list.extend(iter);
        list
    }
}

#[cfg(test)]
mod tests {
    use crate::operator::{InputList, OpError, Operator};
    use crate::ops::{Elementwise, Identity, ScalarOp};
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn test_input_list_first_input_omitted() {
        let value: Value = Tensor::<f32>::zeros(&[2, 2]).into();

        let inputs = InputList::from(&[&value]).with_first_input_omitted(false);
        let err = inputs.require_as::<&Tensor<i32>>(0).err().unwrap();
        assert!(matches!(err, OpError::InputCastFailed { index: 0, .. }));

        let inputs = InputList::from(&[&value]).with_first_input_omitted(true);
        let err = inputs.require_as::<&Tensor<i32>>(0).err().unwrap();
        assert!(matches!(err, OpError::InputCastFailed { index: 1, .. }));

        assert_eq!(inputs.require(1).err(), Some(OpError::MissingInputs));
    }

    #[test]
    fn test_downcast_operator() {
        let add_op = Elementwise::new(ScalarOp::Add);
        let id_op = Identity;

        let add_op_dyn: &dyn Operator = &add_op;
        let id_op_dyn: &dyn Operator = &id_op;

        assert!(add_op_dyn.downcast_ref::<Elementwise>().is_some());
        assert!(id_op_dyn.downcast_ref::<Elementwise>().is_none());
        assert!(add_op_dyn.same_op(&Elementwise::new(ScalarOp::Add)));
        assert!(!add_op_dyn.same_op(&Elementwise::new(ScalarOp::Sub)));
        assert!(!add_op_dyn.same_op(id_op_dyn));
    }
}
