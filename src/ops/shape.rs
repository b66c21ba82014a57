use sten_shape_inference::ops::{
    Fill as FillRule, Shape as ShapeRule, ShapeI as ShapeIRule, SpecifyShape as SpecifyShapeRule,
};
use sten_shape_inference::{InferShapes, InferShapesError, SymTensor, SymbolGen};

use crate::operator::{same_op_by_eq, InputList, OpError, Operator, OutputList, OutputTypeList};
use crate::tensor::Tensor;
use crate::value::{DataType, Value};

fn size_to_i32(size: usize) -> Result<i32, OpError> {
    i32::try_from(size).map_err(|_| OpError::InvalidValue("Dimension size exceeds i32 range"))
}

/// Return the shape of the input as an int vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Shape {}

impl Operator for Shape {
    fn name(&self) -> &str {
        "Shape"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let shape = input
            .shape()
            .iter()
            .map(|&size| size_to_i32(size))
            .collect::<Result<Vec<_>, _>>()?;
        Ok([Tensor::from_vec(shape).into()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&ShapeRule)
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(DataType::Int32)].into()
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Return the size of one dimension of the input as an int scalar.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeI {
    pub index: usize,
}

impl Operator for ShapeI {
    fn name(&self) -> &str {
        "ShapeI"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        let size = input
            .shape()
            .get(self.index)
            .ok_or(OpError::InvalidValue("Dimension index is out of range"))?;
        Ok([Tensor::from_scalar(size_to_i32(*size)?).into()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(DataType::Int32)].into()
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for ShapeI {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        ShapeIRule { index: self.index }.infer_shapes(inputs, sym_gen)
    }
}

/// Check at runtime that the input has a given shape and return it
/// unchanged. `None` entries match any size.
///
/// Shape inference uses the given sizes, so this also serves as a static
/// shape hint.
#[derive(Clone, Debug, PartialEq)]
pub struct SpecifyShape {
    pub shape: Vec<Option<usize>>,
}

impl SpecifyShape {
    pub(crate) fn matches(&self, shape: &[usize]) -> bool {
        shape.len() == self.shape.len()
            && shape
                .iter()
                .zip(&self.shape)
                .all(|(size, spec)| spec.is_none_or(|spec| spec == *size))
    }
}

impl Operator for SpecifyShape {
    fn name(&self) -> &str {
        "SpecifyShape"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        if !self.matches(input.shape()) {
            return Err(OpError::IncompatibleInputShapes(
                "shape does not match SpecifyShape",
            ));
        }
        Ok([input.clone()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for SpecifyShape {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        SpecifyShapeRule { shape: &self.shape }.infer_shapes(inputs, sym_gen)
    }
}

/// Create a float tensor with the shape given by an int vector, filled with
/// a constant.
#[derive(Clone, Debug, PartialEq)]
pub struct Fill {
    pub value: f32,
}

impl Operator for Fill {
    fn name(&self) -> &str {
        "Fill"
    }

    fn max_inputs(&self) -> Option<usize> {
        Some(1)
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let shape = inputs.require_as::<&Tensor<i32>>(0)?;
        if shape.ndim() != 1 {
            return Err(OpError::InvalidValue("Shape must be a vector"));
        }
        let shape = shape
            .data()
            .iter()
            .map(|&size| {
                usize::try_from(size).map_err(|_| OpError::InvalidValue("Shape entries must be >= 0"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok([Tensor::full(&shape, self.value).into()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(&FillRule)
    }

    fn output_types(&self, _input_types: &[Option<DataType>]) -> OutputTypeList {
        [Some(DataType::Float)].into()
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

/// Pass through the first input if every element of each remaining input is
/// non-zero, otherwise fail with [`OpError::AssertionFailed`].
#[derive(Clone, Debug, PartialEq)]
pub struct Assert {
    pub message: String,
}

impl Assert {
    fn condition_holds(value: &Value) -> bool {
        match value {
            Value::FloatTensor(x) => x.data().iter().all(|&x| x != 0.),
            Value::Int32Tensor(x) => x.data().iter().all(|&x| x != 0),
        }
    }
}

impl Operator for Assert {
    fn name(&self) -> &str {
        "Assert"
    }

    fn max_inputs(&self) -> Option<usize> {
        None
    }

    fn is_deterministic(&self) -> bool {
        // Must not be merged away or folded when its conditions are unknown.
        false
    }

    fn run(&self, inputs: &InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        if !inputs.iter().skip(1).all(Self::condition_holds) {
            return Err(OpError::AssertionFailed(self.message.clone()));
        }
        Ok([input.clone()].into())
    }

    fn as_infer_shapes(&self) -> Option<&dyn InferShapes> {
        Some(self)
    }

    fn same_op(&self, other: &dyn Operator) -> bool {
        same_op_by_eq(self, other)
    }
}

impl InferShapes for Assert {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let Some(first) = inputs.first() else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        Ok(vec![first.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::{Assert, Fill, Shape, ShapeI, SpecifyShape};
    use crate::operator::{OpError, OperatorExt};
    use crate::tensor::Tensor;
    use crate::value::Value;

    #[test]
    fn test_shape_ops() {
        let x: Value = Tensor::<f32>::zeros(&[2, 5]).into();
        let shape: Tensor<i32> = Shape {}.run_simple(&x).unwrap();
        assert_eq!(shape.data(), &[2, 5]);

        let size: Tensor<i32> = ShapeI { index: 1 }.run_simple(&x).unwrap();
        assert_eq!(size.item(), Some(&5));

        let err = ShapeI { index: 2 }.run_simple::<_, Tensor<i32>>(&x).err();
        assert_eq!(
            err,
            Some(OpError::InvalidValue("Dimension index is out of range"))
        );
    }

    #[test]
    fn test_specify_shape() {
        let x: Value = Tensor::<f32>::zeros(&[2, 5]).into();
        let op = SpecifyShape {
            shape: vec![None, Some(5)],
        };
        let out: Tensor<f32> = op.run_simple(&x).unwrap();
        assert_eq!(out.shape(), &[2, 5]);

        let op = SpecifyShape {
            shape: vec![Some(3), None],
        };
        let err = op.run_simple::<_, Tensor<f32>>(&x).err();
        assert_eq!(
            err,
            Some(OpError::IncompatibleInputShapes(
                "shape does not match SpecifyShape"
            ))
        );
    }

    #[test]
    fn test_fill() {
        let shape: Value = Tensor::from_vec(vec![2, 2]).into();
        let out: Tensor<f32> = Fill { value: 1.5 }.run_simple(&shape).unwrap();
        assert_eq!(out.data(), &[1.5; 4]);

        let shape: Value = Tensor::from_vec(vec![-1]).into();
        let err = Fill { value: 0. }.run_simple::<_, Tensor<f32>>(&shape).err();
        assert_eq!(err, Some(OpError::InvalidValue("Shape entries must be >= 0")));
    }

    #[test]
    fn test_assert() {
        let op = Assert {
            message: "x must be positive".into(),
        };
        let x: Value = Tensor::from_scalar(2.).into();
        let ok: Value = Tensor::from_scalar(1).into();
        let fail: Value = Tensor::from_vec(vec![1, 0]).into();

        let out: Tensor<f32> = op.run_simple((&x, &ok)).unwrap();
        assert_eq!(out.item(), Some(&2.));

        let err = op.run_simple::<_, Tensor<f32>>((&x, &ok, &fail)).err();
        assert_eq!(
            err,
            Some(OpError::AssertionFailed("x must be positive".into()))
        );
    }
}
