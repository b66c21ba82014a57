//! Traits for shape inference and rules shared by many operators.

use std::fmt;

use smallvec::SmallVec;

use crate::sym_expr::SymExpr;
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

#[derive(Clone, Debug, PartialEq)]
pub enum InferShapesError {
    /// Too many or too few inputs were provided.
    IncorrectInputCount,

    /// The input shapes are incompatible, so execution would fail.
    IncompatibleShapes,

    /// An input's rank, or an axis attribute, does not match what the
    /// operator expects.
    IncorrectRank,

    /// An input or attribute has an invalid value.
    InvalidValue,
}

impl fmt::Display for InferShapesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IncorrectInputCount => write!(f, "incorrect number of inputs"),
            Self::IncompatibleShapes => write!(f, "incompatible input shapes"),
            Self::IncorrectRank => write!(f, "incorrect input rank or axis"),
            Self::InvalidValue => write!(f, "invalid input or attribute value"),
        }
    }
}

impl std::error::Error for InferShapesError {}

/// Infer the shapes, and where possible values, of an operator's outputs
/// from symbolic descriptions of its inputs.
pub trait InferShapes {
    /// Sizes which cannot be expressed in terms of the inputs should be
    /// represented by fresh symbols from `sym_gen`.
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError>;
}

/// Operators whose single output has the shape of the first input.
pub struct UnaryOp;

impl InferShapes for UnaryOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let Some(data) = inputs.first() else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let out = match data.shape() {
            Some(dims) => SymTensor::from_shape(dims.collect()),
            None => SymTensor::unknown("unknown input shape"),
        };
        Ok(vec![out])
    }
}

/// Operators which pass their first input through unchanged, including any
/// symbolic values.
pub struct Identity;

impl InferShapes for Identity {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let Some(data) = inputs.first() else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        Ok(vec![data.clone()])
    }
}

/// Broadcast two shapes together using numpy rules.
///
/// Shapes are aligned at their trailing dimension. Each pair of sizes must be
/// equal or one of them must be 1.
pub fn broadcast_shapes(
    a: &[SymExpr],
    b: &[SymExpr],
) -> Result<Vec<SymExpr>, InferShapesError> {
    let ndim = a.len().max(b.len());
    let one = SymExpr::Value(1);
    let padded = |dims: &[SymExpr], i: usize| -> SymExpr {
        let pad = ndim - dims.len();
        if i < pad {
            one.clone()
        } else {
            dims[i - pad].clone()
        }
    };

    (0..ndim)
        .map(|i| {
            let (a, b) = (padded(a, i), padded(b, i));
            let size = match (a.as_value(), b.as_value()) {
                _ if a == b => a,
                (Some(1), _) => b,
                (_, Some(1)) => a,
                (Some(_), Some(_)) => return Err(InferShapesError::IncompatibleShapes),

                // A fixed size other than 1 forces the symbolic size to
                // match it, or execution fails.
                (Some(_), None) => a,
                (None, Some(_)) => b,

                (None, None) => a.broadcast(&b),
            };
            Ok(size)
        })
        .collect()
}

/// Binary operators whose output shape is the broadcast of two input shapes.
pub struct BinaryOp;

impl InferShapes for BinaryOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [a, b] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let (Some(a_dims), Some(b_dims)) = (a.shape(), b.shape()) else {
            return Ok(vec![SymTensor::unknown("unknown input shape")]);
        };
        let a_dims: Vec<_> = a_dims.collect();
        let b_dims: Vec<_> = b_dims.collect();
        let out_shape = broadcast_shapes(&a_dims, &b_dims)?;
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

/// Operators which combine any number of inputs elementwise, with
/// broadcasting.
pub struct VariadicOp;

impl InferShapes for VariadicOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        if inputs.is_empty() {
            return Err(InferShapesError::IncorrectInputCount);
        }
        let mut out_shape = Vec::new();
        for input in inputs {
            let Some(dims) = input.shape() else {
                return Ok(vec![SymTensor::unknown("unknown input shape")]);
            };
            let dims: Vec<_> = dims.collect();
            out_shape = broadcast_shapes(&out_shape, &dims)?;
        }
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

/// Reductions over a set of axes.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionOp<'a> {
    /// Axes to reduce. `None` reduces all axes.
    pub axes: Option<&'a [i32]>,

    /// True if reduced dimensions are kept with size 1.
    pub keep_dims: bool,
}

impl InferShapes for ReductionOp<'_> {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [data] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let Some(dims) = data.shape() else {
            return Ok(vec![SymTensor::unknown("unknown input shape")]);
        };
        let ndim = dims.len();
        let axes: SmallVec<[usize; 4]> = match self.axes {
            Some(axes) => resolve_axes(ndim, axes)?,
            None => (0..ndim).collect(),
        };

        let out_shape = dims
            .enumerate()
            .filter_map(|(i, dim)| match (axes.contains(&i), self.keep_dims) {
                (false, _) => Some(dim),
                (true, true) => Some(SymExpr::Value(1)),
                (true, false) => None,
            })
            .collect();
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

/// Resolve an axis in `[-ndim, ndim)` to a dimension index in `[0, ndim)`.
pub fn resolve_axis(ndim: usize, axis: i32) -> Result<usize, InferShapesError> {
    let ndim_i = ndim.min(i32::MAX as usize) as i32;
    if axis < -ndim_i || axis >= ndim_i {
        return Err(InferShapesError::IncorrectRank);
    }
    Ok(if axis < 0 {
        (ndim_i + axis) as usize
    } else {
        axis as usize
    })
}

/// Resolve a list of axes with [`resolve_axis`], rejecting duplicates.
pub fn resolve_axes(ndim: usize, axes: &[i32]) -> Result<SmallVec<[usize; 4]>, InferShapesError> {
    let mut resolved = SmallVec::with_capacity(axes.len());
    for &axis in axes {
        let axis = resolve_axis(ndim, axis)?;
        if resolved.contains(&axis) {
            return Err(InferShapesError::InvalidValue);
        }
        resolved.push(axis);
    }
    Ok(resolved)
}
