//! Shape inference rules for individual operators.

mod binary;
mod layout;
mod matmul;
mod shape;

pub use binary::{Arith, ArithOp};
pub use layout::{Concat, Reshape, Transpose};
pub use matmul::MatMul;
pub use shape::{Fill, Shape, ShapeI, SpecifyShape};

use crate::infer_shapes::{InferShapes, InferShapesError, UnaryOp};
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

/// Negation, which propagates symbolic values.
pub struct Neg;

impl InferShapes for Neg {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [input] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        if let Some(x) = input.as_scalar() {
            return Ok(vec![SymTensor::from_scalar((-x.clone()).simplify())]);
        }
        if let Some(values) = input.as_vector() {
            let negated = values.iter().map(|x| (-x.clone()).simplify()).collect();
            return Ok(vec![SymTensor::from_vec(negated)]);
        }
        UnaryOp.infer_shapes(inputs, sym_gen)
    }
}
