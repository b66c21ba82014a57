use std::fmt;

use rayon::prelude::*;
use sten_shape_inference::{InferShapes, InferShapesError, SymTensor, SymbolGen, VariadicOp};

use super::elementwise::{ScalarOp, PARALLEL_CHUNK};
use crate::link::Kernel;
use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList, OutputTypeList};
use crate::tensor::{broadcast_shapes, Shape, Tensor};
use crate::threading::thread_pool;
use crate::value::{DataType, Value};

/// A tree of scalar functions over the elements of an operator's inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarExpr {
    /// Element of the input with a given index.
    Input(usize),
    Constant(f32),
    Unary(ScalarOp, Box<ScalarExpr>),
    Binary(ScalarOp, Box<ScalarExpr>, Box<ScalarExpr>),
}

/// Scalar expression compiled into a tree of closures.
pub type CompiledExpr = Box<dyn Fn(&[f32]) -> f32 + Send + Sync>;

impl ScalarExpr {
    pub fn unary(op: ScalarOp, x: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Unary(op, Box::new(x))
    }

    pub fn binary(op: ScalarOp, a: ScalarExpr, b: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Binary(op, Box::new(a), Box::new(b))
    }

    /// Evaluate the expression given one element from each input.
    ///
    /// Missing inputs evaluate to NaN.
    pub fn eval(&self, inputs: &[f32]) -> f32 {
        match self {
            Self::Input(i) => inputs.get(*i).copied().unwrap_or(f32::NAN),
            Self::Constant(c) => *c,
            Self::Unary(op, x) => op.eval_unary(x.eval(inputs)),
            Self::Binary(op, a, b) => op.eval_binary(a.eval(inputs), b.eval(inputs)),
        }
    }

    /// One more than the largest input index referenced.
    pub fn num_inputs(&self) -> usize {
        match self {
            Self::Input(i) => i + 1,
            Self::Constant(_) => 0,
            Self::Unary(_, x) => x.num_inputs(),
            Self::Binary(_, a, b) => a.num_inputs().max(b.num_inputs()),
        }
    }

    /// Number of scalar functions in the tree.
    pub fn op_count(&self) -> usize {
        match self {
            Self::Input(_) | Self::Constant(_) => 0,
            Self::Unary(_, x) => 1 + x.op_count(),
            Self::Binary(_, a, b) => 1 + a.op_count() + b.op_count(),
        }
    }

    /// Number of times `Input(index)` appears in the tree.
    pub fn input_uses(&self, index: usize) -> usize {
        match self {
            Self::Input(i) => usize::from(*i == index),
            Self::Constant(_) => 0,
            Self::Unary(_, x) => x.input_uses(index),
            Self::Binary(_, a, b) => a.input_uses(index) + b.input_uses(index),
        }
    }

    /// Replace each `Input(i)` with `f(i)`.
    pub fn map_inputs<F: Fn(usize) -> ScalarExpr>(&self, f: &F) -> ScalarExpr {
        match self {
            Self::Input(i) => f(*i),
            Self::Constant(c) => Self::Constant(*c),
            Self::Unary(op, x) => Self::unary(*op, x.map_inputs(f)),
            Self::Binary(op, a, b) => Self::binary(*op, a.map_inputs(f), b.map_inputs(f)),
        }
    }

    /// Compile the expression into a closure.
    ///
    /// The closure must be called with at least [`num_inputs`](Self::num_inputs)
    /// elements.
    pub fn compile(&self) -> CompiledExpr {
        match self {
            Self::Input(i) => {
                let i = *i;
                Box::new(move |xs| xs[i])
            }
            Self::Constant(c) => {
                let c = *c;
                Box::new(move |_| c)
            }
            Self::Unary(op, x) => {
                let op = *op;
                let x = x.compile();
                Box::new(move |xs| op.eval_unary(x(xs)))
            }
            Self::Binary(ScalarOp::Add, a, b) => {
                let (a, b) = (a.compile(), b.compile());
                Box::new(move |xs| a(xs) + b(xs))
            }
            Self::Binary(ScalarOp::Mul, a, b) => {
                let (a, b) = (a.compile(), b.compile());
                Box::new(move |xs| a(xs) * b(xs))
            }
            Self::Binary(op, a, b) => {
                let op = *op;
                let (a, b) = (a.compile(), b.compile());
                Box::new(move |xs| op.eval_binary(a(xs), b(xs)))
            }
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(i) => write!(f, "x{}", i),
            Self::Constant(c) => write!(f, "{}", c),
            Self::Unary(op, x) => write!(f, "{}({})", op, x),
            Self::Binary(op, a, b) => write!(f, "{}({}, {})", op, a, b),
        }
    }
}

/// Applies a [`ScalarExpr`] to each element of its broadcast inputs.
///
/// This is produced by the elementwise fusion rewrite, which merges chains of
/// [`Elementwise`](super::Elementwise) operators so that intermediate values
/// are never materialized.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedElementwise {
    pub expr: ScalarExpr,
    pub num_inputs: usize,
    pub in_place: bool,
}

impl FusedElementwise {
    pub fn new(expr: ScalarExpr) -> FusedElementwise {
        let num_inputs = expr.num_inputs();
        FusedElementwise {
            expr,
            num_inputs,
            in_place: false,
        }
    }

    fn float_inputs<'a>(&self, inputs: &InputList<'a>) -> Result<Vec<&'a Tensor<f32>>, OpError> {
        if inputs.len() < self.num_inputs {
            return Err(OpError::MissingInputs);
        }
        (0..self.num_inputs)
            .map(|i| inputs.require_as::<&Tensor<f32>>(i))
            .collect()
    }
}

fn output_shape(inputs: &[&Tensor<f32>]) -> Result<Shape, OpError> {
    let mut shape = Shape::new();
    for input in inputs {
        shape = broadcast_shapes(&shape, input.shape())
            .ok_or(OpError::IncompatibleInputShapes("Cannot broadcast inputs"))?;
    }
    Ok(shape)
}

/// An input to a fused kernel, read at a given output offset.
enum Source<'a> {
    Scalar(f32),
    Data(&'a [f32]),
}

impl Source<'_> {
    fn get(&self, index: usize) -> f32 {
        match self {
            Source::Scalar(x) => *x,
            Source::Data(data) => data[index],
        }
    }
}

/// Broadcast each input to `shape`, keeping single elements as scalars.
fn broadcast_inputs(inputs: &[&Tensor<f32>], shape: &[usize]) -> Result<Vec<Tensor<f32>>, OpError> {
    inputs
        .iter()
        .map(|input| {
            if input.shape() == shape || input.len() == 1 {
                Ok((*input).clone())
            } else {
                input
                    .broadcast_to(shape)
                    .ok_or(OpError::IncompatibleInputShapes("Cannot broadcast inputs"))
            }
        })
        .collect()
}

fn sources(inputs: &[Tensor<f32>]) -> Vec<Source<'_>> {
    inputs
        .iter()
        .map(|input| match input.item() {
            Some(&x) => Source::Scalar(x),
            None => Source::Data(input.data()),
        })
        .collect()
}

impl Operator for FusedElementwise {
    fn name(&self) -> &str {
        "FusedElementwise"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(self.num_inputs)
    }

    fn can_run_in_place(&self) -> bool {
        self.in_place
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let inputs = self.float_inputs(inputs)?;
        let shape = output_shape(&inputs)?;
        let len: usize = shape.iter().product();
        let inputs = broadcast_inputs(&inputs, &shape)?;
        let sources = sources(&inputs);

        let mut args = vec![0.; self.num_inputs];
        let data: Vec<f32> = (0..len)
            .map(|i| {
                for (arg, src) in args.iter_mut().zip(&sources) {
                    *arg = src.get(i);
                }
                self.expr.eval(&args)
            })
            .collect();
        Ok([Tensor::from_data(&shape, data).into()].into())
    }

    fn run_in_place(&self, input: Value, other: &InputList) -> Result<Value, OpError> {
        if other.len() + 1 < self.num_inputs {
            return Err(OpError::MissingInputs);
        }
        let rest = {
            let first: &Tensor<f32> = (&input).try_into()?;
            let mut tensors = vec![first];
            for i in 0..self.num_inputs.saturating_sub(1) {
                tensors.push(other.require_as(i)?);
            }
            let shape = output_shape(&tensors)?;
            if shape.as_slice() != input.shape() {
                // The output is larger than the first input.
                let mut all_inputs = InputList::new();
                all_inputs.push(&input);
                for value in other.iter() {
                    all_inputs.push(value);
                }
                let mut outputs = self.run(&all_inputs)?;
                return outputs.pop().ok_or(OpError::MissingInputs);
            }
            broadcast_inputs(&tensors[1..], &shape)?
        };
        let rest = sources(&rest);

        let mut output: Tensor<f32> = input.try_into()?;
        let mut args = vec![0.; self.num_inputs];
        for (i, el) in output.data_mut().iter_mut().enumerate() {
            args[0] = *el;
            for (arg, src) in args[1..].iter_mut().zip(&rest) {
                *arg = src.get(i);
            }
            *el = self.expr.eval(&args);
        }
        Ok(output.into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(DataType::Float)].into()
    }

    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(FusedKernel {
            op: self.clone(),
            compiled: self.expr.compile(),
        }))
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for FusedElementwise {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        if inputs.len() != self.num_inputs {
            return Err(InferShapesError::IncorrectInputCount);
        }
        VariadicOp.infer_shapes(inputs, sym_gen)
    }
}

/// Native kernel which evaluates a compiled expression in parallel.
struct FusedKernel {
    op: FusedElementwise,
    compiled: CompiledExpr,
}

impl Kernel for FusedKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let inputs = self.op.float_inputs(inputs)?;
        let shape = output_shape(&inputs)?;
        let len: usize = shape.iter().product();
        let inputs = broadcast_inputs(&inputs, &shape)?;
        let sources = sources(&inputs);
        let num_inputs = self.op.num_inputs;
        let f = &self.compiled;

        let mut out = vec![0.; len];
        thread_pool().run(|| {
            out.par_chunks_mut(PARALLEL_CHUNK)
                .enumerate()
                .for_each(|(chunk_idx, chunk)| {
                    let base = chunk_idx * PARALLEL_CHUNK;
                    let mut args = vec![0.; num_inputs];
                    for (i, el) in chunk.iter_mut().enumerate() {
                        for (arg, src) in args.iter_mut().zip(&sources) {
                            *arg = src.get(base + i);
                        }
                        *el = f(&args);
                    }
                })
        });
        Ok([Tensor::from_data(&shape, out).into()].into())
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
    use super::{FusedElementwise, ScalarExpr};
    use crate::operator::{InputList, OpError, Operator, OperatorExt};
    use crate::ops::ScalarOp;
    use crate::tensor::Tensor;
    use crate::value::Value;

    // (x0 + x1) * exp(x0)
    fn test_expr() -> ScalarExpr {
        ScalarExpr::binary(
            ScalarOp::Mul,
            ScalarExpr::binary(ScalarOp::Add, ScalarExpr::Input(0), ScalarExpr::Input(1)),
            ScalarExpr::unary(ScalarOp::Exp, ScalarExpr::Input(0)),
        )
    }

    #[test]
    fn test_scalar_expr() {
        let expr = test_expr();
        assert_eq!(expr.num_inputs(), 2);
        assert_eq!(expr.op_count(), 3);
        assert_eq!(expr.to_string(), "mul(add(x0, x1), exp(x0))");
        assert_eq!(expr.eval(&[0., 2.]), 2.);

        let compiled = expr.compile();
        assert_eq!(compiled(&[0., 2.]), 2.);
        assert_eq!(compiled(&[1., 1.]), expr.eval(&[1., 1.]));

        let mapped = expr.map_inputs(&|i| ScalarExpr::Input(i + 1));
        assert_eq!(mapped.num_inputs(), 3);
    }

    #[test]
    fn test_fused_elementwise_broadcast() {
        let op = FusedElementwise::new(test_expr());
        let x: Value = Tensor::from_data(&[2, 2], vec![0., 0., 0., 0.]).into();
        let y: Value = Tensor::from_vec(vec![1., 2.]).into();
        let out: Tensor<f32> = op.run_simple((&x, &y)).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[1., 2., 1., 2.]);

        let z: Value = Tensor::from_vec(vec![1., 2., 3.]).into();
        let err = op.run_simple::<_, Tensor<f32>>((&x, &z)).err();
        assert_eq!(
            err,
            Some(OpError::IncompatibleInputShapes("Cannot broadcast inputs"))
        );

        let err = op.run_simple::<_, Tensor<f32>>(&x).err();
        assert_eq!(err, Some(OpError::MissingInputs));
    }

    #[test]
    fn test_fused_elementwise_in_place() {
        let mut op = FusedElementwise::new(test_expr());
        op.in_place = true;
        let x = Tensor::from_data(&[2, 2], vec![0., 0., 0., 0.]);
        let y: Value = Tensor::from_scalar(3.).into();
        let out: Tensor<f32> = op.run_simple_in_place(x, &y).unwrap();
        assert_eq!(out.data(), &[3., 3., 3., 3.]);

        // First input smaller than the output.
        let x = Tensor::from_vec(vec![0.]);
        let y: Value = Tensor::from_vec(vec![1., 2.]).into();
        let out: Tensor<f32> = op.run_simple_in_place(x, &y).unwrap();
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.data(), &[1., 2.]);

        let x = Tensor::from_vec(vec![0.]);
        let err = op.run_simple_in_place::<_, _, Tensor<f32>>(x, ()).err();
        assert_eq!(err, Some(OpError::MissingInputs));
    }

    #[test]
    fn test_native_kernel_matches_reference() {
        let op = FusedElementwise::new(test_expr());
        let kernel = op.native_kernel().unwrap();
        let x: Value = Tensor::from_data(&[3, 2], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).into();
        let y: Value = Tensor::from_data(&[3, 1], vec![1., 2., 3.]).into();
        let inputs = InputList::from(&[&x, &y]);
        assert_eq!(kernel.run(&inputs).unwrap(), op.run(&inputs).unwrap());
    }
}
