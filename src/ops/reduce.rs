use rayon::prelude::*;
use smallvec::SmallVec;
use sten_shape_inference::{InferShapes, InferShapesError, ReductionOp, SymTensor, SymbolGen, UnaryOp};

use crate::link::Kernel;
use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList};
use crate::tensor::{broadcast_offsets, Tensor};
use crate::threading::thread_pool;
use crate::value::Value;

/// Resolve an axis which may be negative to count from the end.
pub(crate) fn resolve_axis(ndim: usize, axis: i32) -> Result<usize, OpError> {
    let resolved = if axis < 0 {
        ndim as i32 + axis
    } else {
        axis
    };
    if resolved < 0 || resolved as usize >= ndim {
        return Err(OpError::InvalidValue("Axis is invalid"));
    }
    Ok(resolved as usize)
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

/// Reduce a tensor over a set of axes.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduce {
    pub op: ReduceOp,

    /// Axes to reduce, which may be negative. `None` reduces all axes.
    pub axes: Option<Vec<i32>>,

    /// Keep reduced dimensions with size 1.
    pub keep_dims: bool,
}

/// Axes and output shapes for a reduction.
struct ReducePlan {
    /// Shape of the output with reduced dimensions kept with size 1.
    keep_shape: SmallVec<[usize; 4]>,
    out_shape: SmallVec<[usize; 4]>,
    /// Number of input elements reduced into each output.
    count: usize,
    /// True if only the last axis is reduced.
    last_axis_only: bool,
}

impl Reduce {
    pub fn new(op: ReduceOp, axes: Option<Vec<i32>>, keep_dims: bool) -> Reduce {
        Reduce {
            op,
            axes,
            keep_dims,
        }
    }

    fn plan(&self, shape: &[usize]) -> Result<ReducePlan, OpError> {
        let ndim = shape.len();
        let mut reduced = SmallVec::<[bool; 4]>::from_elem(self.axes.is_none(), ndim);
        if let Some(axes) = &self.axes {
            for &axis in axes {
                reduced[resolve_axis(ndim, axis)?] = true;
            }
        }

        let keep_shape: SmallVec<[usize; 4]> = shape
            .iter()
            .zip(&reduced)
            .map(|(&size, &reduced)| if reduced { 1 } else { size })
            .collect();
        let out_shape = if self.keep_dims {
            keep_shape.clone()
        } else {
            shape
                .iter()
                .zip(&reduced)
                .filter(|(_, &reduced)| !reduced)
                .map(|(&size, _)| size)
                .collect()
        };
        let count = shape
            .iter()
            .zip(&reduced)
            .filter(|(_, &reduced)| reduced)
            .map(|(&size, _)| size)
            .product();
        let last_axis_only = ndim > 0 && reduced.iter().filter(|r| **r).count() == 1 && reduced[ndim - 1];

        Ok(ReducePlan {
            keep_shape,
            out_shape,
            count,
            last_axis_only,
        })
    }

    fn reduce<T: Copy>(
        &self,
        input: &Tensor<T>,
        plan: &ReducePlan,
        init: T,
        f: impl Fn(T, T) -> T,
    ) -> Vec<T> {
        let out_len: usize = plan.keep_shape.iter().product();
        let mut out = vec![init; out_len];
        for (&x, offset) in input
            .data()
            .iter()
            .zip(broadcast_offsets(&plan.keep_shape, input.shape()))
        {
            out[offset] = f(out[offset], x);
        }
        out
    }

    fn check_non_empty(&self, plan: &ReducePlan) -> Result<(), OpError> {
        let out_len: usize = plan.out_shape.iter().product();
        if self.op == ReduceOp::Max && plan.count == 0 && out_len > 0 {
            return Err(OpError::InvalidValue("Cannot compute Max of empty tensor"));
        }
        Ok(())
    }
}

impl Operator for Reduce {
    fn name(&self) -> &str {
        match self.op {
            ReduceOp::Sum => "ReduceSum",
            ReduceOp::Mean => "ReduceMean",
            ReduceOp::Max => "ReduceMax",
        }
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let plan = self.plan(input.shape())?;
        self.check_non_empty(&plan)?;

        let output: Value = match (input, self.op) {
            (Value::FloatTensor(x), ReduceOp::Sum) => {
                Tensor::from_data(&plan.out_shape, self.reduce(x, &plan, 0., |a, b| a + b)).into()
            }
            (Value::FloatTensor(x), ReduceOp::Mean) => {
                let mut sum = self.reduce(x, &plan, 0., |a, b| a + b);
                let count = plan.count as f32;
                for el in &mut sum {
                    *el /= count;
                }
                Tensor::from_data(&plan.out_shape, sum).into()
            }
            (Value::FloatTensor(x), ReduceOp::Max) => {
                let max = self.reduce(x, &plan, f32::NEG_INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() {
                        f32::NAN
                    } else {
                        a.max(b)
                    }
                });
                Tensor::from_data(&plan.out_shape, max).into()
            }
            (Value::Int32Tensor(x), ReduceOp::Sum) => Tensor::from_data(
                &plan.out_shape,
                self.reduce(x, &plan, 0, |a, b| a.wrapping_add(b)),
            )
            .into(),
            (Value::Int32Tensor(x), ReduceOp::Max) => {
                Tensor::from_data(&plan.out_shape, self.reduce(x, &plan, i32::MIN, i32::max)).into()
            }
            (Value::Int32Tensor(_), ReduceOp::Mean) => return Err(OpError::UnsupportedType),
        };
        Ok([output].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(ReduceKernel { op: self.clone() }))
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for Reduce {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        ReductionOp {
            axes: self.axes.as_deref(),
            keep_dims: self.keep_dims,
        }
        .infer_shapes(inputs, sym_gen)
    }
}

/// Reduction kernel which processes rows in parallel when reducing the
/// last axis of a float tensor.
struct ReduceKernel {
    op: Reduce,
}

impl Kernel for ReduceKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let Some(Value::FloatTensor(x)) = inputs.get(0) else {
            return self.op.run(inputs);
        };
        let plan = self.op.plan(x.shape())?;
        if !plan.last_axis_only || plan.count == 0 {
            return self.op.run(inputs);
        }

        let row_len = plan.count;
        let mut out = vec![0.; x.len() / row_len];
        let op = self.op.op;
        thread_pool().run(|| {
            out.par_iter_mut()
                .zip(x.data().par_chunks(row_len))
                .for_each(|(y, row)| {
                    *y = match op {
                        ReduceOp::Sum => row.iter().sum(),
                        ReduceOp::Mean => row.iter().sum::<f32>() / row_len as f32,
                        ReduceOp::Max => row.iter().fold(f32::NEG_INFINITY, |a, &b| {
                            if a.is_nan() || b.is_nan() {
                                f32::NAN
                            } else {
                                a.max(b)
                            }
                        }),
                    }
                })
        });
        Ok([Tensor::from_data(&plan.out_shape, out).into()].into())
    }
}

/// Normalized exponential over one axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Softmax {
    pub axis: i32,
}

/// Compute softmax in-place over a contiguous lane.
fn softmax_lane(lane: &mut [f32]) {
    let max = lane.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.;
    for x in lane.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in lane.iter_mut() {
        *x /= sum;
    }
}

impl Softmax {
    /// Return (outer, axis, inner) sizes for the lanes being normalized.
    fn lanes(&self, shape: &[usize]) -> Result<(usize, usize, usize), OpError> {
        let axis = resolve_axis(shape.len(), self.axis)?;
        let outer = shape[..axis].iter().product();
        let inner = shape[axis + 1..].iter().product();
        Ok((outer, shape[axis], inner))
    }
}

impl Operator for Softmax {
    fn name(&self) -> &str {
        "Softmax"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require_as::<&Tensor<f32>>(0)?;
        let (outer, axis_len, inner) = self.lanes(input.shape())?;
        let mut output = input.clone();
        let data = output.data_mut();
        let mut lane = vec![0.; axis_len];
        for o in 0..outer {
            for j in 0..inner {
                let base = o * axis_len * inner + j;
                for k in 0..axis_len {
                    lane[k] = data[base + k * inner];
                }
                softmax_lane(&mut lane);
                for k in 0..axis_len {
                    data[base + k * inner] = lane[k];
                }
            }
        }
        Ok([output.into()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&UnaryOp)
    }

    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(SoftmaxKernel { op: self.clone() }))
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Softmax kernel which normalizes rows in parallel when the axis is
/// innermost.
struct SoftmaxKernel {
    op: Softmax,
}

impl Kernel for SoftmaxKernel {
    fn name(&self) -> &str {
        "Softmax"
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require_as::<&Tensor<f32>>(0)?;
        let (_outer, axis_len, inner) = self.op.lanes(input.shape())?;
        if inner != 1 || axis_len == 0 {
            return self.op.run(inputs);
        }
        let mut data = input.data().to_vec();
        thread_pool().run(|| data.par_chunks_mut(axis_len).for_each(softmax_lane));
        Ok([Tensor::from_data(input.shape(), data).into()].into())
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::{expect_all_close, TestCases};

    use super::{Reduce, ReduceOp, Softmax};
    use crate::operator::{InputList, OpError, Operator, OperatorExt};
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn test_reduce() {
        #[derive(Debug)]
        struct Case {
            op: Reduce,
            expected_shape: Vec<usize>,
            expected: Vec<f32>,
        }

        let cases = [
            Case {
                op: Reduce::new(ReduceOp::Sum, None, false),
                expected_shape: vec![],
                expected: vec![21.],
            },
            Case {
                op: Reduce::new(ReduceOp::Sum, Some(vec![0]), false),
                expected_shape: vec![3],
                expected: vec![5., 7., 9.],
            },
            Case {
                op: Reduce::new(ReduceOp::Mean, Some(vec![-1]), true),
                expected_shape: vec![2, 1],
                expected: vec![2., 5.],
            },
            Case {
                op: Reduce::new(ReduceOp::Max, Some(vec![1]), false),
                expected_shape: vec![2],
                expected: vec![3., 6.],
            },
        ];

        cases.test_each(|case| {
            let x: Value = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]).into();
            let out: Tensor<f32> = case.op.run_simple(&x).unwrap();
            assert_eq!(out.shape(), case.expected_shape.as_slice());
            assert_eq!(out.data(), case.expected.as_slice());

            let kernel = case.op.native_kernel().unwrap();
            let inputs = InputList::from(&[&x]);
            assert_eq!(kernel.run(&inputs).unwrap(), case.op.run(&inputs).unwrap());
        });
    }

    #[test]
    fn test_reduce_errors() {
        let empty: Value = Tensor::<f32>::zeros(&[2, 0]).into();
        let op = Reduce::new(ReduceOp::Max, Some(vec![1]), false);
        assert_eq!(
            op.run_simple::<_, Tensor<f32>>(&empty).err(),
            Some(OpError::InvalidValue("Cannot compute Max of empty tensor"))
        );

        let op = Reduce::new(ReduceOp::Sum, Some(vec![2]), false);
        assert_eq!(
            op.run_simple::<_, Tensor<f32>>(&empty).err(),
            Some(OpError::InvalidValue("Axis is invalid"))
        );

        let ints: Value = Tensor::from_vec(vec![1, 2, 3]).into();
        let op = Reduce::new(ReduceOp::Mean, None, false);
        assert_eq!(
            op.run_simple::<_, Tensor<i32>>(&ints).err(),
            Some(OpError::UnsupportedType)
        );
        let op = Reduce::new(ReduceOp::Sum, None, false);
        let sum: Tensor<i32> = op.run_simple(&ints).unwrap();
        assert_eq!(sum.item(), Some(&6));
    }

    #[test]
    fn test_softmax() {
        let x: Value = Tensor::from_data(&[2, 2], vec![0., 0., 1., 3.]).into();

        let out: Tensor<f32> = Softmax { axis: -1 }.run_simple(&x).unwrap();
        let e = (2f32).exp();
        expect_all_close(
            out.data(),
            &[0.5, 0.5, 1. / (1. + e), e / (1. + e)],
            1e-6,
            0.,
        )
        .unwrap();

        let out: Tensor<f32> = Softmax { axis: 0 }.run_simple(&x).unwrap();
        let e1 = (1f32).exp();
        let e3 = (3f32).exp();
        expect_all_close(
            out.data(),
            &[1. / (1. + e1), 1. / (1. + e3), e1 / (1. + e1), e3 / (1. + e3)],
            1e-6,
            0.,
        )
        .unwrap();

        let op = Softmax { axis: -1 };
        let kernel = op.native_kernel().unwrap();
        let inputs = InputList::from(&[&x]);
        let actual: Tensor<f32> = kernel.run(&inputs).unwrap().remove(0).try_into().unwrap();
        let expected: Tensor<f32> = op.run(&inputs).unwrap().remove(0).try_into().unwrap();
        expect_all_close(actual.data(), expected.data(), 1e-6, 0.).unwrap();
    }
}
