//! The set of operators which can appear in a [`Graph`](crate::graph::Graph).
//!
//! Every operator has a reference implementation ([`Operator::run`]) and a
//! shape inference rule. Operators with a specialized implementation expose it
//! via [`Operator::native_kernel`](crate::operator::Operator::native_kernel).
//!
//! [`Operator::run`]: crate::operator::Operator::run

mod elementwise;
mod fused;
mod layout;
mod matmul;
mod reduce;
mod shape;

pub use elementwise::{Elementwise, ScalarOp};
pub use fused::{CompiledExpr, FusedElementwise, ScalarExpr};
pub use layout::{Cast, Concat, Identity, Reshape, Transpose};
pub use matmul::MatMul;
pub use reduce::{Reduce, ReduceOp, Softmax};
pub use shape::{Assert, Fill, Shape, ShapeI, SpecifyShape};
