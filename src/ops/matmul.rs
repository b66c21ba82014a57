use rayon::prelude::*;
use sten_shape_inference::ops::MatMul as MatMulRule;
use sten_shape_inference::InferShapes;

use crate::link::Kernel;
use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList, OutputTypeList};
use crate::tensor::{broadcast_offsets, broadcast_shapes, Shape, Tensor};
use crate::threading::thread_pool;
use crate::value::DataType;

/// Shapes and batch offsets for a batched matrix multiplication.
struct MatMulPlan {
    out_shape: Shape,
    m: usize,
    k: usize,
    n: usize,
    /// Matrix indices into the LHS and RHS for each output batch.
    batches: Vec<(usize, usize)>,
}

impl MatMulPlan {
    fn new(a: &[usize], b: &[usize]) -> Result<MatMulPlan, OpError> {
        if a.len() < 2 || b.len() < 2 {
            return Err(OpError::InvalidValue("MatMul inputs must have at least 2 dims"));
        }
        let (a_batch, a_mat) = a.split_at(a.len() - 2);
        let (b_batch, b_mat) = b.split_at(b.len() - 2);
        let [m, k] = [a_mat[0], a_mat[1]];
        let [b_k, n] = [b_mat[0], b_mat[1]];
        if k != b_k {
            return Err(OpError::IncompatibleInputShapes(
                "Columns of first matrix does not match rows of second matrix",
            ));
        }
        let batch = broadcast_shapes(a_batch, b_batch).ok_or(
            OpError::IncompatibleInputShapes("Cannot broadcast batch dimensions"),
        )?;
        let batches = broadcast_offsets(a_batch, &batch)
            .zip(broadcast_offsets(b_batch, &batch))
            .collect();

        let mut out_shape = batch;
        out_shape.extend([m, n]);
        Ok(MatMulPlan {
            out_shape,
            m,
            k,
            n,
            batches,
        })
    }

    fn output_len(&self) -> usize {
        self.out_shape.iter().product()
    }

    /// Compute row `row` of the output matrix for one batch.
    fn row(&self, a: &[f32], b: &[f32], (a_mat, b_mat): (usize, usize), row: usize, out: &mut [f32]) {
        let (k, n) = (self.k, self.n);
        let a_row = &a[a_mat * self.m * k + row * k..][..k];
        let b_mat = &b[b_mat * k * n..][..k * n];
        out.fill(0.);
        for (kk, &a_el) in a_row.iter().enumerate() {
            let b_row = &b_mat[kk * n..][..n];
            for (y, &b_el) in out.iter_mut().zip(b_row) {
                *y += a_el * b_el;
            }
        }
    }
}

/// Matrix multiplication of the last two dimensions, with broadcasting of
/// leading batch dimensions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatMul {}

impl MatMul {
    fn run_float(&self, a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>, OpError> {
        let plan = MatMulPlan::new(a.shape(), b.shape())?;
        let mut out = vec![0.; plan.output_len()];
        if plan.n > 0 && plan.m > 0 {
            for (rows, &batch) in out.chunks_mut(plan.m * plan.n).zip(&plan.batches) {
                for (i, row) in rows.chunks_mut(plan.n).enumerate() {
                    plan.row(a.data(), b.data(), batch, i, row);
                }
            }
        }
        Ok(Tensor::from_data(&plan.out_shape, out))
    }
}

impl Operator for MatMul {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let a = inputs.require_as::<&Tensor<f32>>(0)?;
        let b = inputs.require_as::<&Tensor<f32>>(1)?;
        Ok([self.run_float(a, b)?.into()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&MatMulRule)
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(DataType::Float)].into()
    }

    fn native_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(MatMulKernel {}))
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Matrix multiplication which computes output rows in parallel.
struct MatMulKernel {}

impl Kernel for MatMulKernel {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let a = inputs.require_as::<&Tensor<f32>>(0)?;
        let b = inputs.require_as::<&Tensor<f32>>(1)?;
        let plan = MatMulPlan::new(a.shape(), b.shape())?;
        let mut out = vec![0.; plan.output_len()];

        if plan.n > 0 && plan.m > 0 {
            let (m, n) = (plan.m, plan.n);
            thread_pool().run(|| {
                out.par_chunks_mut(n).enumerate().for_each(|(r, row)| {
                    let batch = plan.batches[r / m];
                    plan.row(a.data(), b.data(), batch, r % m, row);
                })
            });
        }
        Ok([Tensor::from_data(&plan.out_shape, out).into()].into())
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::MatMul;
    use crate::operator::{InputList, OpError, Operator, OperatorExt};
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn test_matmul() {
        let a: Value = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]).into();
        let b: Value = Tensor::from_data(&[3, 2], vec![7., 8., 9., 10., 11., 12.]).into();
        let out: Tensor<f32> = MatMul {}.run_simple((&a, &b)).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[58., 64., 139., 154.]);
    }

    #[test]
    fn test_matmul_broadcast_batch() {
        // LHS has two batches, RHS is shared.
        let a: Value = Tensor::from_data(&[2, 1, 2], vec![1., 2., 3., 4.]).into();
        let b: Value = Tensor::from_data(&[2, 1], vec![1., 1.]).into();
        let out: Tensor<f32> = MatMul {}.run_simple((&a, &b)).unwrap();
        assert_eq!(out.shape(), &[2, 1, 1]);
        assert_eq!(out.data(), &[3., 7.]);
    }

    #[test]
    fn test_matmul_invalid() {
        #[derive(Debug)]
        struct Case {
            a: Vec<usize>,
            b: Vec<usize>,
            expected: OpError,
        }

        let cases = [
            Case {
                a: vec![3],
                b: vec![3, 2],
                expected: OpError::InvalidValue("MatMul inputs must have at least 2 dims"),
            },
            Case {
                a: vec![2, 3],
                b: vec![2, 2],
                expected: OpError::IncompatibleInputShapes(
                    "Columns of first matrix does not match rows of second matrix",
                ),
            },
            Case {
                a: vec![2, 2, 3],
                b: vec![3, 3, 2],
                expected: OpError::IncompatibleInputShapes("Cannot broadcast batch dimensions"),
            },
        ];

        cases.test_each(|case| {
            let a: Value = Tensor::<f32>::zeros(&case.a).into();
            let b: Value = Tensor::<f32>::zeros(&case.b).into();
            let err = MatMul {}.run_simple::<_, Tensor<f32>>((&a, &b)).err();
            assert_eq!(err.as_ref(), Some(&case.expected));
        });
    }

    #[test]
    fn test_native_kernel_matches_reference() {
        let op = MatMul {};
        let kernel = op.native_kernel().unwrap();
        let a: Value = Tensor::from_data(
            &[2, 2, 3],
            (0..12).map(|x| x as f32 * 0.5).collect(),
        )
        .into();
        let b: Value = Tensor::from_data(&[3, 4], (0..12).map(|x| x as f32).collect()).into();
        let inputs = InputList::from(&[&a, &b]);
        assert_eq!(kernel.run(&inputs).unwrap(), op.run(&inputs).unwrap());

        let empty: Value = Tensor::<f32>::zeros(&[0, 3]).into();
        let inputs = InputList::from(&[&empty, &b]);
        let out = kernel.run(&inputs).unwrap();
        assert_eq!(out[0].shape(), &[0, 4]);
    }
}
