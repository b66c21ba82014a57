//! Static shape inference for sten graphs.
//!
//! Shape inference traces how operators transform the shapes of their inputs
//! without executing them. Dimension sizes are described by [`SymExpr`]
//! expressions over named symbols, so a graph whose input has shape
//! `(batch, 784)` can be shown to produce an output of shape `(batch, 10)`
//! for any batch size.
//!
//! Integer scalars and vectors additionally carry symbolic _values_. This
//! lets inference follow computations on shapes inside the graph. For
//! example:
//!
//! ```text
//! S = Shape(X)                  // values [batch, seq, 64]
//! B = ShapeI<index=0>(X)        // value batch
//! T = Concat<axis=0>([B], [-1]) // values [batch, -1]
//! Y = Reshape(X, T)             // shape [batch, 64 * seq]
//! ```
//!
//! Each operator's rule implements [`InferShapes`]. Rules shared by whole
//! categories of operators, such as [`UnaryOp`] and [`BinaryOp`], are
//! exported from the crate root. Rules for specific operators are in [`ops`].

mod infer_shapes;
pub mod ops;
mod sym_expr;
mod sym_gen;
mod sym_tensor;

pub use infer_shapes::{
    broadcast_shapes, resolve_axes, resolve_axis, BinaryOp, Identity, InferShapes,
    InferShapesError, ReductionOp, UnaryOp, VariadicOp,
};
pub use sym_expr::{EvalError, SymExpr, Symbol, SymbolMap};
pub use sym_gen::SymbolGen;
pub use sym_tensor::{Constant, SymTensor};
