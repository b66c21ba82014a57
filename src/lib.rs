//! sten is a compiler and runtime for symbolic tensor expressions.
//!
//! # Building and compiling graphs
//!
//! Computations are described as a [`Graph`] of operators and values,
//! usually built with [`graph::builder::Expr`]. Inputs can declare symbolic
//! dimensions such as `batch`, which shape inference tracks through the
//! graph.
//!
//! [`compile`] turns a graph into a [`Function`] according to a [`Mode`]:
//!
//! 1. The graph is checked with [`Graph::validate`].
//! 2. The rewrite rules selected by the mode's optimizer query are applied
//!    until no rule makes further changes. See [`optimize`].
//! 3. Shapes are inferred for every value in the optimized graph.
//! 4. The mode's [`Linker`](link::Linker) chooses how each operator runs
//!    and produces a [`Program`](link::Program).
//!
//! ```
//! use sten::graph::builder::Expr;
//! use sten::graph::Dimension;
//! use sten::ops::{Elementwise, Reduce, ReduceOp, ScalarOp};
//! use sten::{compile, DataType, Mode, Tensor};
//!
//! let x = Expr::value_with_info(
//!     "x",
//!     DataType::Float,
//!     &[Dimension::Symbolic("batch".into()), Dimension::Fixed(3)],
//! );
//! let y = (x.unary(Elementwise::new(ScalarOp::Exp)) * 2f32)
//!     .unary(Reduce::new(ReduceOp::Sum, Some(vec![-1]), false));
//! let graph = Expr::make_graph([x], [y]);
//!
//! let func = compile(graph, &Mode::fast_run()).unwrap();
//! let x = Tensor::from_data(&[2, 3], vec![0.; 6]);
//! let outputs = func.run(vec![x.into()]).unwrap();
//! assert_eq!(outputs[0].shape(), &[2]);
//! ```
//!
//! # Modes
//!
//! The predefined modes are `FAST_COMPILE`, `FAST_RUN`, `DebugMode` and
//! `NONE`. [`Mode::default_mode`] selects one from the `STEN_MODE`
//! environment variable.
//!
//! # Threading
//!
//! Native kernels run large operations in parallel in a Rayon thread pool
//! sized to match the number of physical cores. You can access this pool
//! using [`thread_pool`] to run your own tasks in it.
//!
//! # Environment variables
//!
//! - `STEN_MODE`, `STEN_LINKER`, `STEN_OPTIMIZER_INCLUDING` and
//!   `STEN_OPTIMIZER_EXCLUDING` configure [`Mode::default_mode`].
//! - `STEN_TIMING` prints a timing summary after each run and
//!   `STEN_VERBOSE` logs each step.
//! - `STEN_NUM_THREADS` sets the size of the thread pool.

mod env;
mod function;
mod mode;
mod printer;
mod tensor;
mod threading;
mod timing;
mod value;

pub mod graph;
pub mod infer_shapes;
pub mod link;
pub mod operator;
pub mod ops;
pub mod optimize;

pub use function::{compile, CompileError, Function};
pub use graph::{Dimension, Graph, NodeId, RunError, RunErrorKind};
pub use link::{RunOptions, Strategy};
pub use mode::{Mode, DEBUG_MODE, FAST_COMPILE, FAST_RUN, MODE_NAMES, NONE};
pub use printer::debug_print;
pub use tensor::{DataLenError, Tensor};
pub use threading::{thread_pool, ThreadPool};
pub use timing::{RunTiming, TimingFilter, TimingRecord, TimingSort};
pub use value::{DataType, DataTypeOf, TryFromValueError, Value, ValueMeta};

pub use sten_shape_inference::{EvalError, SymExpr, SymbolMap};
