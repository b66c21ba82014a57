use std::fmt;

use rayon::prelude::*;
use sten_shape_inference::ops::{Arith, ArithOp, Neg};
use sten_shape_inference::{
    BinaryOp, InferShapes, InferShapesError, SymTensor, SymbolGen, UnaryOp,
};

use crate::link::Kernel;
use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList, OutputTypeList};
use crate::tensor::{broadcast_offsets, broadcast_shapes, can_broadcast_to, Tensor};
use crate::threading::thread_pool;
use crate::value::{DataType, Value};

/// Minimum number of elements per task when parallelizing elementwise work.
pub(crate) const PARALLEL_CHUNK: usize = 16 * 1024;

/// A scalar function applied to each element (or pair of broadcast
/// elements) of its inputs.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ScalarOp {
    Neg,
    Exp,
    Log,
    Log1p,
    Sqrt,
    Abs,
    Tanh,
    Sigmoid,
    Softplus,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
    Minimum,
}

impl ScalarOp {
    pub const ALL: [ScalarOp; 16] = [
        ScalarOp::Neg,
        ScalarOp::Exp,
        ScalarOp::Log,
        ScalarOp::Log1p,
        ScalarOp::Sqrt,
        ScalarOp::Abs,
        ScalarOp::Tanh,
        ScalarOp::Sigmoid,
        ScalarOp::Softplus,
        ScalarOp::Add,
        ScalarOp::Sub,
        ScalarOp::Mul,
        ScalarOp::Div,
        ScalarOp::Pow,
        ScalarOp::Maximum,
        ScalarOp::Minimum,
    ];

    /// Number of operands.
    pub fn arity(self) -> usize {
        match self {
            Self::Neg
            | Self::Exp
            | Self::Log
            | Self::Log1p
            | Self::Sqrt
            | Self::Abs
            | Self::Tanh
            | Self::Sigmoid
            | Self::Softplus => 1,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Pow
            | Self::Maximum
            | Self::Minimum => 2,
        }
    }

    /// Name of the operator which applies this function.
    pub fn name(self) -> &'static str {
        match self {
            Self::Neg => "Neg",
            Self::Exp => "Exp",
            Self::Log => "Log",
            Self::Log1p => "Log1p",
            Self::Sqrt => "Sqrt",
            Self::Abs => "Abs",
            Self::Tanh => "Tanh",
            Self::Sigmoid => "Sigmoid",
            Self::Softplus => "Softplus",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Pow => "Pow",
            Self::Maximum => "Maximum",
            Self::Minimum => "Minimum",
        }
    }

    /// Look up a function by case-insensitive name, eg. "exp" or "maximum".
    pub fn from_name(name: &str) -> Option<ScalarOp> {
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::Maximum | Self::Minimum
        )
    }

    /// Return true if this function is defined for integer tensors.
    pub fn supports_int(self) -> bool {
        matches!(
            self,
            Self::Neg
                | Self::Abs
                | Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Maximum
                | Self::Minimum
        )
    }

    /// Evaluate a unary function. Binary functions return NaN.
    pub fn eval_unary(self, x: f32) -> f32 {
        match self {
            Self::Neg => -x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Log1p => x.ln_1p(),
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => sigmoid(x),
            Self::Softplus => softplus(x),
            _ => f32::NAN,
        }
    }

    /// Evaluate a binary function. Unary functions return NaN.
    pub fn eval_binary(self, x: f32, y: f32) -> f32 {
        match self {
            Self::Add => x + y,
            Self::Sub => x - y,
            Self::Mul => x * y,
            Self::Div => x / y,
            Self::Pow => x.powf(y),
            // Propagate NaNs, unlike `f32::max`.
            Self::Maximum => {
                if x.is_nan() || y.is_nan() {
                    f32::NAN
                } else {
                    x.max(y)
                }
            }
            Self::Minimum => {
                if x.is_nan() || y.is_nan() {
                    f32::NAN
                } else {
                    x.min(y)
                }
            }
            _ => f32::NAN,
        }
    }

    fn eval_unary_int(self, x: i32) -> Result<i32, OpError> {
        match self {
            Self::Neg => Ok(x.wrapping_neg()),
            Self::Abs => Ok(x.wrapping_abs()),
            _ => Err(OpError::UnsupportedType),
        }
    }

    fn eval_binary_int(self, x: i32, y: i32) -> Result<i32, OpError> {
        match self {
            Self::Add => Ok(x.wrapping_add(y)),
            Self::Sub => Ok(x.wrapping_sub(y)),
            Self::Mul => Ok(x.wrapping_mul(y)),
            Self::Div => floor_div(x, y),
            Self::Maximum => Ok(x.max(y)),
            Self::Minimum => Ok(x.min(y)),
            _ => Err(OpError::UnsupportedType),
        }
    }

    fn arith_op(self) -> Option<ArithOp> {
        match self {
            Self::Add => Some(ArithOp::Add),
            Self::Sub => Some(ArithOp::Sub),
            Self::Mul => Some(ArithOp::Mul),
            Self::Div => Some(ArithOp::Div),
            Self::Maximum => Some(ArithOp::Max),
            Self::Minimum => Some(ArithOp::Min),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name().to_ascii_lowercase())
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// Computes `log(1 + exp(x))` without overflowing for large `x`.
fn softplus(x: f32) -> f32 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Integer division which rounds towards negative infinity.
fn floor_div(x: i32, y: i32) -> Result<i32, OpError> {
    if y == 0 {
        return Err(OpError::InvalidValue("integer division by zero"));
    }
    let q = x
        .checked_div(y)
        .ok_or(OpError::InvalidValue("integer division overflow"))?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// Apply `f` to pairs of elements from `a` and `b` broadcast together.
pub(crate) fn binary_op<T: Copy, R, F: Fn(T, T) -> Result<R, OpError>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: F,
) -> Result<Tensor<R>, OpError> {
    let out_shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or(OpError::IncompatibleInputShapes("Cannot broadcast inputs"))?;

    let data: Result<Vec<R>, OpError> = if a.shape() == b.shape() {
        a.data()
            .iter()
            .zip(b.data())
            .map(|(&x, &y)| f(x, y))
            .collect()
    } else {
        broadcast_offsets(a.shape(), &out_shape)
            .zip(broadcast_offsets(b.shape(), &out_shape))
            .map(|(i, j)| f(a.data()[i], b.data()[j]))
            .collect()
    };
    Ok(Tensor::from_data(&out_shape, data?))
}

/// Update `a` with the result of `f(a, b)`, where `b` is broadcast to the
/// shape of `a`.
fn binary_op_in_place<T: Copy, F: Fn(T, T) -> Result<T, OpError>>(
    a: &mut Tensor<T>,
    b: &Tensor<T>,
    f: F,
) -> Result<(), OpError> {
    let out_shape: Vec<usize> = a.shape().to_vec();
    if b.shape() == out_shape.as_slice() {
        for (x, &y) in a.data_mut().iter_mut().zip(b.data()) {
            *x = f(*x, y)?;
        }
    } else {
        for (x, j) in a
            .data_mut()
            .iter_mut()
            .zip(broadcast_offsets(b.shape(), &out_shape))
        {
            *x = f(*x, b.data()[j])?;
        }
    }
    Ok(())
}

/// Elementwise application of a [`ScalarOp`], with NumPy broadcasting for
/// binary functions.
#[derive(Clone, Debug, PartialEq)]
pub struct Elementwise {
    pub op: ScalarOp,

    /// True if the output may overwrite the first input.
    pub in_place: bool,
}

impl Elementwise {
    pub fn new(op: ScalarOp) -> Elementwise {
        Elementwise {
            op,
            in_place: false,
        }
    }

    fn input_pair<'a>(&self, inputs: &InputList<'a>) -> Result<(&'a Value, &'a Value), OpError> {
        let a = inputs.require(0)?;
        let b = inputs.require(1)?;
        if a.dtype() != b.dtype() {
            return Err(OpError::UnsupportedType);
        }
        Ok((a, b))
    }
}

impl Operator for Elementwise {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(self.op.arity())
    }

    fn is_commutative(&self) -> bool {
        self.op.is_commutative()
    }

    fn can_run_in_place(&self) -> bool {
        self.in_place
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let op = self.op;
        let output: Value = if op.arity() == 1 {
            match inputs.require(0)? {
                Value::FloatTensor(x) => x.map(|&x| op.eval_unary(x)).into(),
                Value::Int32Tensor(x) => {
                    let data: Result<Vec<i32>, OpError> =
                        x.data().iter().map(|&x| op.eval_unary_int(x)).collect();
                    Tensor::from_data(x.shape(), data?).into()
                }
            }
        } else {
            match self.input_pair(inputs)? {
                (Value::FloatTensor(a), Value::FloatTensor(b)) => {
                    binary_op(a, b, |x, y| Ok(op.eval_binary(x, y)))?.into()
                }
                (Value::Int32Tensor(a), Value::Int32Tensor(b)) => {
                    if !op.supports_int() {
                        return Err(OpError::UnsupportedType);
                    }
                    binary_op(a, b, |x, y| op.eval_binary_int(x, y))?.into()
                }
                _ => return Err(OpError::UnsupportedType),
            }
        };
        Ok([output].into())
    }

    fn run_in_place(&self, input: Value, other: &InputList) -> Result<Value, OpError> {
        let op = self.op;
        if op.arity() == 1 {
            return match input {
                Value::FloatTensor(mut x) => {
                    for el in x.data_mut() {
                        *el = op.eval_unary(*el);
                    }
                    Ok(x.into())
                }
                Value::Int32Tensor(mut x) => {
                    for el in x.data_mut() {
                        *el = op.eval_unary_int(*el)?;
                    }
                    Ok(x.into())
                }
            };
        }

        let rhs = other.require(0)?;
        if !can_broadcast_to(rhs.shape(), input.shape()) {
            // The output is larger than the first input, so it can't be
            // reused.
            let inputs = InputList::from(&[&input, rhs]);
            let mut outputs = self.run(&inputs)?;
            return outputs.pop().ok_or(OpError::MissingInputs);
        }

        match (input, rhs) {
            (Value::FloatTensor(mut a), Value::FloatTensor(b)) => {
                binary_op_in_place(&mut a, b, |x, y| Ok(op.eval_binary(x, y)))?;
                Ok(a.into())
            }
            (Value::Int32Tensor(mut a), Value::Int32Tensor(b)) if op.supports_int() => {
                binary_op_in_place(&mut a, b, |x, y| op.eval_binary_int(x, y))?;
                Ok(a.into())
            }
            _ => Err(OpError::UnsupportedType),
        }
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn output_types(&self, input_types: &[Option<DataType>]) -> OutputTypeList {
        [input_types.iter().copied().flatten().next()].into()
    }

    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(ElementwiseKernel {
            op: self.clone(),
        }))
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for Elementwise {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        if self.op == ScalarOp::Neg {
            return Neg.infer_shapes(inputs, sym_gen);
        }
        if self.op.arity() == 1 {
            return UnaryOp.infer_shapes(inputs, sym_gen);
        }
        match self.op.arith_op() {
            Some(op) => Arith { op }.infer_shapes(inputs, sym_gen),
            None => BinaryOp.infer_shapes(inputs, sym_gen),
        }
    }
}

/// Native elementwise kernel.
///
/// Float tensors with matching shapes, or where one operand is a single
/// element, are processed in parallel chunks. Other cases use the
/// reference implementation.
struct ElementwiseKernel {
    op: Elementwise,
}

impl ElementwiseKernel {
    fn run_float(&self, a: &Tensor<f32>, b: Option<&Tensor<f32>>) -> Option<Tensor<f32>> {
        let op = self.op.op;
        let out = match b {
            None => {
                let mut out = vec![0.; a.len()];
                thread_pool().run(|| {
                    out.par_chunks_mut(PARALLEL_CHUNK)
                        .zip(a.data().par_chunks(PARALLEL_CHUNK))
                        .for_each(|(out, a)| {
                            for (y, &x) in out.iter_mut().zip(a) {
                                *y = op.eval_unary(x);
                            }
                        })
                });
                Tensor::from_data(a.shape(), out)
            }
            Some(b) if a.shape() == b.shape() => {
                let mut out = vec![0.; a.len()];
                thread_pool().run(|| {
                    out.par_chunks_mut(PARALLEL_CHUNK)
                        .zip(a.data().par_chunks(PARALLEL_CHUNK))
                        .zip(b.data().par_chunks(PARALLEL_CHUNK))
                        .for_each(|((out, a), b)| {
                            for ((z, &x), &y) in out.iter_mut().zip(a).zip(b) {
                                *z = op.eval_binary(x, y);
                            }
                        })
                });
                Tensor::from_data(a.shape(), out)
            }
            Some(b) if b.len() == 1 && b.ndim() <= a.ndim() => {
                let y = *b.item()?;
                let mut out = vec![0.; a.len()];
                thread_pool().run(|| {
                    out.par_chunks_mut(PARALLEL_CHUNK)
                        .zip(a.data().par_chunks(PARALLEL_CHUNK))
                        .for_each(|(out, a)| {
                            for (z, &x) in out.iter_mut().zip(a) {
                                *z = op.eval_binary(x, y);
                            }
                        })
                });
                Tensor::from_data(a.shape(), out)
            }
            Some(_) => return None,
        };
        Some(out)
    }
}

impl Kernel for ElementwiseKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let a = inputs.require(0)?;
        let b = inputs.get(1);
        if let Value::FloatTensor(a) = a {
            let b = match b {
                Some(Value::FloatTensor(b)) => Some(b),
                Some(_) => return Err(OpError::UnsupportedType),
                None => None,
            };
            if let Some(out) = self.run_float(a, b) {
                return Ok([out.into()].into());
            }
        }
        self.op.run(inputs)
    }

    fn can_run_in_place(&self) -> bool {
        self.op.in_place
    }

    fn run_in_place(&self, input: Value, other: &InputList) -> Result<Value, OpError> {
        self.op.run_in_place(input, other)
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{floor_div, softplus, Elementwise, ScalarOp};
    use crate::operator::{InputList, OpError, Operator, OperatorExt};
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn test_scalar_op_names() {
        for op in ScalarOp::ALL {
            assert_eq!(ScalarOp::from_name(op.name()), Some(op));
        }
        assert_eq!(ScalarOp::from_name("log1p"), Some(ScalarOp::Log1p));
        assert_eq!(ScalarOp::from_name("erf"), None);
    }

    #[test]
    fn test_unary_ops() {
        #[derive(Debug)]
        struct Case {
            op: ScalarOp,
            input: f32,
            expected: f32,
        }

        let cases = [
            Case {
                op: ScalarOp::Neg,
                input: 2.,
                expected: -2.,
            },
            Case {
                op: ScalarOp::Exp,
                input: 0.,
                expected: 1.,
            },
            Case {
                op: ScalarOp::Log1p,
                input: 0.,
                expected: 0.,
            },
            Case {
                op: ScalarOp::Sigmoid,
                input: 0.,
                expected: 0.5,
            },
            Case {
                op: ScalarOp::Sigmoid,
                input: -100.,
                expected: 0.,
            },
            Case {
                op: ScalarOp::Softplus,
                input: 100.,
                expected: 100.,
            },
            Case {
                op: ScalarOp::Abs,
                input: -3.,
                expected: 3.,
            },
        ];

        cases.test_each(|case| {
            let x: Value = Tensor::from_scalar(case.input).into();
            let y: Tensor<f32> = Elementwise::new(case.op).run_simple(&x).unwrap();
            let y = *y.item().unwrap();
            assert!((y - case.expected).abs() < 1e-6, "{} != {}", y, case.expected);
        });
    }

    #[test]
    fn test_softplus_is_stable() {
        assert!(softplus(1000.).is_finite());
        assert!((softplus(0.) - 2f32.ln()).abs() < 1e-6);
        assert!(softplus(-1000.) >= 0.);
    }

    #[test]
    fn test_binary_broadcast() {
        let a: Value = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]).into();
        let b: Value = Tensor::from_data(&[3], vec![10., 20., 30.]).into();
        let out: Tensor<f32> = Elementwise::new(ScalarOp::Add)
            .run_simple((&a, &b))
            .unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.data(), &[11., 22., 33., 14., 25., 36.]);

        let c: Value = Tensor::from_data(&[2], vec![1., 2.]).into();
        let err = Elementwise::new(ScalarOp::Add)
            .run_simple::<_, Tensor<f32>>((&a, &c))
            .err();
        assert_eq!(
            err,
            Some(OpError::IncompatibleInputShapes("Cannot broadcast inputs"))
        );
    }

    #[test]
    fn test_int_ops() {
        let a: Value = Tensor::from_vec(vec![7, -7, 6]).into();
        let b: Value = Tensor::from_scalar(2).into();
        let out: Tensor<i32> = Elementwise::new(ScalarOp::Div)
            .run_simple((&a, &b))
            .unwrap();
        assert_eq!(out.data(), &[3, -4, 3]);

        let err = Elementwise::new(ScalarOp::Exp)
            .run_simple::<_, Tensor<i32>>(&a)
            .err();
        assert_eq!(err, Some(OpError::UnsupportedType));

        assert_eq!(
            floor_div(1, 0),
            Err(OpError::InvalidValue("integer division by zero"))
        );
        assert_eq!(floor_div(-6, 3), Ok(-2));
    }

    #[test]
    fn test_mixed_types_are_rejected() {
        let a: Value = Tensor::from_scalar(1.0f32).into();
        let b: Value = Tensor::from_scalar(1).into();
        let err = Elementwise::new(ScalarOp::Mul)
            .run_simple::<_, Tensor<f32>>((&a, &b))
            .err();
        assert_eq!(err, Some(OpError::UnsupportedType));
    }

    #[test]
    fn test_run_in_place() {
        let op = Elementwise {
            op: ScalarOp::Mul,
            in_place: true,
        };
        assert!(op.can_run_in_place());

        let a = Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]);
        let b: Value = Tensor::from_vec(vec![2., 3.]).into();
        let out: Tensor<f32> = op.run_simple_in_place(a, &b).unwrap();
        assert_eq!(out.data(), &[2., 6., 6., 12.]);

        // When the second input is larger, a new output is allocated.
        let a = Tensor::from_vec(vec![2., 3.]);
        let b: Value = Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]).into();
        let out: Tensor<f32> = op.run_simple_in_place(a, &b).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[2., 6., 6., 12.]);
    }

    #[test]
    fn test_native_kernel_matches_reference() {
        let op = Elementwise::new(ScalarOp::Sub);
        let kernel = op.native_kernel().unwrap();

        let a: Value = Tensor::from_data(&[3, 2], vec![1., 2., 3., 4., 5., 6.]).into();
        for b in [
            Tensor::from_data(&[3, 2], vec![1., 1., 1., 1., 1., 1.]),
            Tensor::from_scalar(1.),
            Tensor::from_vec(vec![1., 1.]),
        ] {
            let b: Value = b.into();
            let inputs = InputList::from(&[&a, &b]);
            let expected = op.run(&inputs).unwrap();
            let actual = kernel.run(&inputs).unwrap();
            assert_eq!(actual, expected);
        }
    }
}
