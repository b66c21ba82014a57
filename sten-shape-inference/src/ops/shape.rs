use crate::infer_shapes::{InferShapes, InferShapesError};
use crate::sym_expr::SymExpr;
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

/// Returns the shape of its input as an integer vector.
///
/// The output's values are the input's symbolic dimension sizes.
pub struct Shape;

impl InferShapes for Shape {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [input] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let out = match input.shape() {
            Some(dims) => SymTensor::from_vec(dims.collect()),
            None => SymTensor::from_shape(vec![sym_gen.gen_positive()]),
        };
        Ok(vec![out])
    }
}

/// Returns the size of one dimension of its input as an integer scalar.
pub struct ShapeI {
    pub index: usize,
}

impl InferShapes for ShapeI {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [input] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let size = match input.ndim() {
            Some(ndim) if self.index >= ndim => return Err(InferShapesError::IncorrectRank),
            Some(_) => input
                .size(self.index)
                .ok_or(InferShapesError::IncorrectRank)?,
            None => sym_gen.gen_positive(),
        };
        Ok(vec![SymTensor::from_scalar(size)])
    }
}

/// Asserts that its input has a given shape, where `None` entries leave a
/// dimension unconstrained.
pub struct SpecifyShape<'a> {
    pub shape: &'a [Option<usize>],
}

impl InferShapes for SpecifyShape<'_> {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [input] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let Some(dims) = input.shape() else {
            let out_shape = self
                .shape
                .iter()
                .map(|size| match size {
                    Some(size) => SymExpr::Value(*size as i32),
                    None => sym_gen.gen_positive(),
                })
                .collect();
            return Ok(vec![SymTensor::from_shape(out_shape)]);
        };

        if dims.len() != self.shape.len() {
            return Err(InferShapesError::IncorrectRank);
        }
        let mut refined = false;
        let mut out_shape = Vec::with_capacity(dims.len());
        for (dim, spec) in dims.zip(self.shape) {
            match (dim.as_value(), spec) {
                (Some(actual), Some(spec)) if actual != *spec as i32 => {
                    return Err(InferShapesError::IncompatibleShapes);
                }
                (None, Some(spec)) => {
                    refined = true;
                    out_shape.push(SymExpr::Value(*spec as i32));
                }
                _ => out_shape.push(dim),
            }
        }

        // Keep symbolic values if the shape was already fully known.
        if refined {
            Ok(vec![SymTensor::from_shape(out_shape)])
        } else {
            Ok(vec![input.clone()])
        }
    }
}

/// Creates a tensor filled with a constant, with the shape given by an
/// integer vector input.
pub struct Fill;

impl InferShapes for Fill {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [shape] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        if shape.ndim().is_some_and(|ndim| ndim != 1) {
            return Err(InferShapesError::IncorrectRank);
        }
        if let Some(values) = shape.values() {
            if values.iter().any(|v| matches!(v.as_value(), Some(v) if v < 0)) {
                return Err(InferShapesError::InvalidValue);
            }
            return Ok(vec![SymTensor::from_shape(values.to_vec())]);
        }
        let out = match shape.size(0).and_then(|len| len.as_value()) {
            Some(len) => SymTensor::from_shape((0..len).map(|_| sym_gen.gen_positive()).collect()),
            None => SymTensor::unknown("unknown shape length"),
        };
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::{Fill, Shape, ShapeI, SpecifyShape};
    use crate::infer_shapes::{InferShapes, InferShapesError};
    use crate::sym_gen::SymbolGen;
    use crate::sym_tensor::{sym_shape, sym_vec, SymTensor};

    #[test]
    fn test_shape() {
        let mut sym_gen = SymbolGen::new();
        let out = Shape
            .infer_shapes(&[sym_shape!("batch", 16)], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_vec!("batch", 16)]);

        let out = Shape
            .infer_shapes(&[SymTensor::unknown("test")], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_shape!("unknown_1")]);
    }

    #[test]
    fn test_shape_i() {
        let mut sym_gen = SymbolGen::new();
        let out = ShapeI { index: 1 }
            .infer_shapes(&[sym_shape!("batch", "seq")], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [SymTensor::from_scalar("seq".into())]);

        let err = ShapeI { index: 2 }
            .infer_shapes(&[sym_shape!("batch", "seq")], &mut sym_gen)
            .err();
        assert_eq!(err, Some(InferShapesError::IncorrectRank));
    }

    #[test]
    fn test_specify_shape() {
        let mut sym_gen = SymbolGen::new();

        let op = SpecifyShape {
            shape: &[None, Some(4)],
        };
        let out = op.infer_shapes(&[sym_shape!("n", "m")], &mut sym_gen).unwrap();
        assert_eq!(out, [sym_shape!("n", 4)]);

        let out = op.infer_shapes(&[sym_shape!("n", 4)], &mut sym_gen).unwrap();
        assert_eq!(out, [sym_shape!("n", 4)]);

        let out = op
            .infer_shapes(&[SymTensor::unknown("test")], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_shape!("unknown_1", 4)]);

        let err = op.infer_shapes(&[sym_shape!("n", 5)], &mut sym_gen).err();
        assert_eq!(err, Some(InferShapesError::IncompatibleShapes));

        let err = op.infer_shapes(&[sym_shape!(4)], &mut sym_gen).err();
        assert_eq!(err, Some(InferShapesError::IncorrectRank));
    }

    #[test]
    fn test_fill() {
        let mut sym_gen = SymbolGen::new();

        let out = Fill.infer_shapes(&[sym_vec!("n", 3)], &mut sym_gen).unwrap();
        assert_eq!(out, [sym_shape!("n", 3)]);

        let out = Fill
            .infer_shapes(&[SymTensor::from_shape(vec![2.into()])], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_shape!("unknown_1", "unknown_2")]);

        let err = Fill.infer_shapes(&[sym_vec!(-1)], &mut sym_gen).err();
        assert_eq!(err, Some(InferShapesError::InvalidValue));
    }
}
