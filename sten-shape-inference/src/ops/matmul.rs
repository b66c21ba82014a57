use crate::infer_shapes::{broadcast_shapes, InferShapes, InferShapesError};
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

/// Batched matrix multiplication of `[..., M, K]` and `[..., K, N]` inputs.
///
/// Batch dimensions are broadcast together.
pub struct MatMul;

impl InferShapes for MatMul {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [lhs, rhs] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let (Some(lhs_dims), Some(rhs_dims)) = (lhs.shape(), rhs.shape()) else {
            return Ok(vec![SymTensor::unknown("unknown input shape")]);
        };
        let lhs_dims: Vec<_> = lhs_dims.collect();
        let rhs_dims: Vec<_> = rhs_dims.collect();

        let ([lhs_batch @ .., m, lhs_k], [rhs_batch @ .., rhs_k, n]) =
            (lhs_dims.as_slice(), rhs_dims.as_slice())
        else {
            return Err(InferShapesError::IncorrectRank);
        };

        if let (Some(a), Some(b)) = (lhs_k.as_value(), rhs_k.as_value()) {
            if a != b {
                return Err(InferShapesError::IncompatibleShapes);
            }
        }

        let mut out_shape = broadcast_shapes(lhs_batch, rhs_batch)?;
        out_shape.push(m.clone());
        out_shape.push(n.clone());
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}
