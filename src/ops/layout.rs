use smallvec::SmallVec;
use sten_shape_inference::ops::{Concat as ConcatRule, Reshape as ReshapeRule, Transpose as TransposeRule};
use sten_shape_inference::{
    Identity as IdentityRule, InferShapes, InferShapesError, SymTensor, SymbolGen, UnaryOp,
};

use super::reduce::resolve_axis;
use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList, OutputTypeList};
use crate::tensor::{strides, Tensor};
use crate::value::{DataType, Value};

/// Resolve a target shape which may contain one `-1` entry, for an input
/// with `len` elements.
fn resolve_shape(len: usize, shape: &[i32]) -> Result<SmallVec<[usize; 4]>, OpError> {
    let mut infer_pos = None;
    let mut known = 1usize;
    for (i, &size) in shape.iter().enumerate() {
        match size {
            -1 if infer_pos.is_some() => {
                return Err(OpError::InvalidValue("Multiple -1 entries in shape"));
            }
            -1 => infer_pos = Some(i),
            size if size < 0 => return Err(OpError::InvalidValue("Shape entries must be >= -1")),
            size => {
                known = known
                    .checked_mul(size as usize)
                    .ok_or(OpError::InvalidValue("Shape is too large"))?;
            }
        }
    }

    let mut resolved: SmallVec<[usize; 4]> = shape.iter().map(|&size| size.max(0) as usize).collect();
    if let Some(pos) = infer_pos {
        if known == 0 || len % known != 0 {
            return Err(OpError::IncompatibleInputShapes(
                "Input cannot be reshaped to requested shape",
            ));
        }
        resolved[pos] = len / known;
    } else if known != len {
        return Err(OpError::IncompatibleInputShapes(
            "Input cannot be reshaped to requested shape",
        ));
    }
    Ok(resolved)
}

/// Change the shape of a tensor without copying its data.
///
/// The second input is an int vector target shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reshape {}

impl Operator for Reshape {
    fn name(&self) -> &str {
        "Reshape"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let shape = inputs.require_as::<&Tensor<i32>>(1)?;
        if shape.ndim() != 1 {
            return Err(OpError::InvalidValue("Shape must be a vector"));
        }
        let shape = resolve_shape(input.len(), shape.data())?;
        let output = input.reshaped(&shape).ok_or(OpError::IncompatibleInputShapes(
            "Input cannot be reshaped to requested shape",
        ))?;
        Ok([output].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&ReshapeRule)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Permute the dimensions of a tensor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transpose {
    /// Order of input dimensions in the output. `None` reverses them.
    pub perm: Option<Vec<usize>>,
}

impl Transpose {
    fn resolve_perm(&self, ndim: usize) -> Result<SmallVec<[usize; 4]>, OpError> {
        let perm: SmallVec<[usize; 4]> = match &self.perm {
            Some(perm) => SmallVec::from_slice(perm),
            None => (0..ndim).rev().collect(),
        };
        let mut seen = SmallVec::<[bool; 4]>::from_elem(false, ndim);
        if perm.len() != ndim {
            return Err(OpError::InvalidValue("Permutation is invalid"));
        }
        for &axis in &perm {
            if axis >= ndim || seen[axis] {
                return Err(OpError::InvalidValue("Permutation is invalid"));
            }
            seen[axis] = true;
        }
        Ok(perm)
    }
}

fn transpose<T: Copy>(input: &Tensor<T>, perm: &[usize]) -> Tensor<T> {
    let in_shape = input.shape();
    let in_strides = strides(in_shape);
    let out_shape: SmallVec<[usize; 4]> = perm.iter().map(|&axis| in_shape[axis]).collect();
    let perm_strides: SmallVec<[usize; 4]> = perm.iter().map(|&axis| in_strides[axis]).collect();

    let len = input.len();
    let mut out = Vec::with_capacity(len);
    let mut index = SmallVec::<[usize; 4]>::from_elem(0, out_shape.len());
    let mut offset = 0;
    for _ in 0..len {
        out.push(input.data()[offset]);
        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            offset += perm_strides[dim];
            if index[dim] < out_shape[dim] {
                break;
            }
            offset -= perm_strides[dim] * index[dim];
            index[dim] = 0;
        }
    }
    Tensor::from_data(&out_shape, out)
}

impl Operator for Transpose {
    fn name(&self) -> &str {
        "Transpose"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let perm = self.resolve_perm(input.ndim())?;
        let output: Value = match input {
            Value::FloatTensor(x) => transpose(x, &perm).into(),
            Value::Int32Tensor(x) => transpose(x, &perm).into(),
        };
        Ok([output].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for Transpose {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        TransposeRule {
            perm: self.perm.as_deref(),
        }
        .infer_shapes(inputs, sym_gen)
    }
}

/// Join tensors along an existing axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Concat {
    pub axis: i32,
}

fn concat<T: Copy>(inputs: &[&Tensor<T>], axis: i32) -> Result<Tensor<T>, OpError> {
    let Some(first) = inputs.first() else {
        return Err(OpError::MissingInputs);
    };
    let ndim = first.ndim();
    let axis = resolve_axis(ndim, axis)?;
    for input in inputs {
        let same_dims = input.ndim() == ndim
            && (0..ndim).all(|d| d == axis || input.shape()[d] == first.shape()[d]);
        if !same_dims {
            return Err(OpError::IncompatibleInputShapes(
                "Inputs must have the same shape except along the concat axis",
            ));
        }
    }

    let mut out_shape: SmallVec<[usize; 4]> = SmallVec::from_slice(first.shape());
    out_shape[axis] = inputs.iter().map(|x| x.shape()[axis]).sum();
    let outer: usize = first.shape()[..axis].iter().product();
    let inner: usize = first.shape()[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(out_shape.iter().product());
    for o in 0..outer {
        for input in inputs {
            let chunk = input.shape()[axis] * inner;
            out.extend_from_slice(&input.data()[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(Tensor::from_data(&out_shape, out))
}

impl Operator for Concat {
    fn name(&self) -> &str {
        "Concat"
    }

    fn max_inputs(&self) -> Option<usize> {
        None
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let first = inputs.require(0)?;
        let output: Value = match first {
            Value::FloatTensor(_) => {
                let inputs: Vec<&Tensor<f32>> = (0..inputs.len())
                    .map(|i| inputs.require_as::<&Tensor<f32>>(i))
                    .collect::<Result<_, _>>()?;
                concat(&inputs, self.axis)?.into()
            }
            Value::Int32Tensor(_) => {
                let inputs: Vec<&Tensor<i32>> = (0..inputs.len())
                    .map(|i| inputs.require_as::<&Tensor<i32>>(i))
                    .collect::<Result<_, _>>()?;
                concat(&inputs, self.axis)?.into()
            }
        };
        Ok([output].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for Concat {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        ConcatRule { axis: self.axis }.infer_shapes(inputs, sym_gen)
    }
}

/// Convert a tensor to another data type.
///
/// Floats are truncated towards zero and saturate when converted to ints.
#[derive(Clone, Debug, PartialEq)]
pub struct Cast {
    pub to: DataType,
}

impl Operator for Cast {
    fn name(&self) -> &str {
        "Cast"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let output: Value = match (input, self.to) {
            (Value::FloatTensor(x), DataType::Int32) => x.map(|&x| x as i32).into(),
            (Value::Int32Tensor(x), DataType::Float) => x.map(|&x| x as f32).into(),
            (value, _) => value.clone(),
        };
        Ok([output].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        // Integer values are tracked symbolically, so casts to int must
        // preserve them.
        match self.to {
            DataType::Int32 => Some(&IdentityRule),
            DataType::Float => Some(&UnaryOp),
        }
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(self.to)].into()
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Return the input unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity;

impl Operator for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        Ok([inputs.require(0)?.clone()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&IdentityRule)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{resolve_shape, Cast, Concat, Identity, Reshape, Transpose};
    use crate::operator::{OpError, OperatorExt};
    use crate::tensor::Tensor;
    use crate::value::{DataType, Value};

    #[test]
    fn test_resolve_shape() {
        #[derive(Debug)]
        struct Case {
            len: usize,
            shape: Vec<i32>,
            expected: Result<Vec<usize>, OpError>,
        }

        let cases = [
            Case {
                len: 6,
                shape: vec![3, 2],
                expected: Ok(vec![3, 2]),
            },
            Case {
                len: 6,
                shape: vec![-1, 3],
                expected: Ok(vec![2, 3]),
            },
            Case {
                len: 6,
                shape: vec![-1, -1],
                expected: Err(OpError::InvalidValue("Multiple -1 entries in shape")),
            },
            Case {
                len: 6,
                shape: vec![4, -1],
                expected: Err(OpError::IncompatibleInputShapes(
                    "Input cannot be reshaped to requested shape",
                )),
            },
            Case {
                len: 0,
                shape: vec![0, 3],
                expected: Ok(vec![0, 3]),
            },
        ];

        cases.test_each(|case| {
            let result = resolve_shape(case.len, &case.shape).map(|s| s.to_vec());
            assert_eq!(result, case.expected);
        });
    }

    #[test]
    fn test_reshape_shares_data() {
        let x = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]);
        let x_val: Value = x.clone().into();
        let shape: Value = Tensor::from_vec(vec![3, -1]).into();
        let out: Tensor<f32> = Reshape {}.run_simple((&x_val, &shape)).unwrap();
        assert_eq!(out.shape(), &[3, 2]);
        assert!(out.shares_data(&x));
    }

    #[test]
    fn test_transpose() {
        let x: Value = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]).into();
        let out: Tensor<i32> = Transpose::default().run_simple(&x).unwrap();
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.data(), &[1, 4, 2, 5, 3, 6]);

        let x: Value = Tensor::from_data(&[1, 2, 2], vec![1, 2, 3, 4]).into();
        let op = Transpose {
            perm: Some(vec![0, 2, 1]),
        };
        let out: Tensor<i32> = op.run_simple(&x).unwrap();
        assert_eq!(out.data(), &[1, 3, 2, 4]);

        let op = Transpose {
            perm: Some(vec![0, 0, 1]),
        };
        assert_eq!(
            op.run_simple::<_, Tensor<i32>>(&x).err(),
            Some(OpError::InvalidValue("Permutation is invalid"))
        );
    }

    #[test]
    fn test_concat() {
        let a: Value = Tensor::from_data(&[2, 1], vec![1., 2.]).into();
        let b: Value = Tensor::from_data(&[2, 2], vec![3., 4., 5., 6.]).into();
        let out: Tensor<f32> = Concat { axis: -1 }.run_simple((&a, &b)).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.data(), &[1., 3., 4., 2., 5., 6.]);

        let err = Concat { axis: 0 }.run_simple::<_, Tensor<f32>>((&a, &b)).err();
        assert_eq!(
            err,
            Some(OpError::IncompatibleInputShapes(
                "Inputs must have the same shape except along the concat axis"
            ))
        );

        let c: Value = Tensor::from_vec(vec![1, 2]).into();
        let err = Concat { axis: 0 }.run_simple::<_, Tensor<f32>>((&a, &c)).err();
        assert!(matches!(err, Some(OpError::InputCastFailed { index: 1, .. })));
    }

    #[test]
    fn test_cast_and_identity() {
        let x: Value = Tensor::from_vec(vec![1.5, -2.7]).into();
        let out: Tensor<i32> = Cast { to: DataType::Int32 }.run_simple(&x).unwrap();
        assert_eq!(out.data(), &[1, -2]);

        let out: Tensor<f32> = Identity.run_simple(&x).unwrap();
        assert_eq!(out.data(), &[1.5, -2.7]);
    }
}
