//! Conversion of parsed expressions into graph expressions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sten::graph::builder::Expr;
use sten::ops::{
    Cast, Concat, Elementwise, Fill, Identity, MatMul, Reduce, ReduceOp, Reshape, ScalarOp, Shape,
    ShapeI, Softmax, SpecifyShape, Transpose,
};
use sten::{DataType, Tensor};

use crate::parser::{Ast, BinOp};

#[derive(Clone, Debug, PartialEq)]
pub enum LowerError {
    /// A name was used that is not a declared input.
    UnknownName(String),
    UnknownFunction(String),
    ArgCount {
        func: String,
        expected: &'static str,
        actual: usize,
    },
    UnknownKeyword {
        func: String,
        name: String,
    },
    InvalidArg {
        func: String,
        arg: &'static str,
        expected: &'static str,
    },
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::UnknownName(name) => write!(
                f,
                "\"{}\" is not an input. Declare it with --input {}",
                name, name
            ),
            LowerError::UnknownFunction(func) => write!(f, "unknown function \"{}\"", func),
            LowerError::ArgCount {
                func,
                expected,
                actual,
            } => write!(
                f,
                "{}() takes {} positional arguments but {} were given",
                func, expected, actual
            ),
            LowerError::UnknownKeyword { func, name } => {
                write!(f, "{}() has no argument \"{}\"", func, name)
            }
            LowerError::InvalidArg {
                func,
                arg,
                expected,
            } => write!(f, "argument \"{}\" of {}() must be {}", arg, func, expected),
        }
    }
}

impl std::error::Error for LowerError {}

/// Arguments of a function call, consumed as the call is lowered.
struct CallArgs<'a> {
    func: &'a str,
    args: &'a [Ast],
    kwargs: &'a [(String, Ast)],
}

impl<'a> CallArgs<'a> {
    fn check_count(&self, min: usize, max: usize, expected: &'static str) -> Result<(), LowerError> {
        if self.args.len() < min || self.args.len() > max {
            return Err(LowerError::ArgCount {
                func: self.func.to_string(),
                expected,
                actual: self.args.len(),
            });
        }
        Ok(())
    }

    fn check_keywords(&self, allowed: &[&str]) -> Result<(), LowerError> {
        let unknown = self
            .kwargs
            .iter()
            .find(|(name, _)| !allowed.contains(&name.as_str()));
        if let Some((name, _)) = unknown {
            return Err(LowerError::UnknownKeyword {
                func: self.func.to_string(),
                name: name.clone(),
            });
        }
        Ok(())
    }

    /// Return an argument given either at position `index` or by name.
    fn get(&self, index: usize, name: &str) -> Option<&'a Ast> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
            .or_else(|| self.args.get(index))
    }

    fn invalid(&self, arg: &'static str, expected: &'static str) -> LowerError {
        LowerError::InvalidArg {
            func: self.func.to_string(),
            arg,
            expected,
        }
    }

    fn int(&self, index: usize, name: &'static str) -> Result<Option<i32>, LowerError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Ast::Number(x)) if x.fract() == 0. => Ok(Some(*x as i32)),
            Some(Ast::Neg(x)) => match x.as_ref() {
                Ast::Number(x) if x.fract() == 0. => Ok(Some(-*x as i32)),
                _ => Err(self.invalid(name, "an integer")),
            },
            Some(_) => Err(self.invalid(name, "an integer")),
        }
    }

    fn int_list(&self, index: usize, name: &'static str) -> Result<Option<Vec<i32>>, LowerError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Ast::List(items)) => Ok(Some(items.clone())),
            Some(_) => self
                .int(index, name)
                .map_err(|_| self.invalid(name, "an integer or list of integers"))
                .map(|x| x.map(|x| vec![x])),
        }
    }

    fn flag(&self, index: usize, name: &'static str) -> Result<bool, LowerError> {
        Ok(self.int(index, name)?.is_some_and(|x| x != 0))
    }
}

/// Converts parsed expressions into [`Expr`]s over a set of declared inputs.
pub struct Lowering {
    inputs: HashMap<String, Expr>,
}

impl Lowering {
    pub fn new<'a>(inputs: impl IntoIterator<Item = (&'a str, Expr)>) -> Lowering {
        Lowering {
            inputs: inputs
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
        }
    }

    pub fn lower(&self, ast: &Ast) -> Result<Expr, LowerError> {
        match ast {
            Ast::Number(x) => Ok(Expr::constant(*x)),
            Ast::Name(name) => self
                .inputs
                .get(name)
                .cloned()
                .ok_or_else(|| LowerError::UnknownName(name.clone())),
            Ast::List(items) => Ok(Expr::constant(Tensor::from_vec(items.clone()))),
            Ast::Neg(x) => Ok(-self.lower(x)?),
            Ast::Binary { op, lhs, rhs } => {
                let lhs = self.lower(lhs)?;
                let rhs = self.lower(rhs)?;
                Ok(match op {
                    BinOp::Add => lhs + rhs,
                    BinOp::Sub => lhs - rhs,
                    BinOp::Mul => lhs * rhs,
                    BinOp::Div => lhs / rhs,
                    BinOp::Pow => lhs.binary(Elementwise::new(ScalarOp::Pow), rhs),
                })
            }
            Ast::Call { name, args, kwargs } => self.lower_call(CallArgs {
                func: name,
                args,
                kwargs,
            }),
        }
    }

    fn lower_call(&self, call: CallArgs) -> Result<Expr, LowerError> {
        if let Some(op) = ScalarOp::from_name(call.func) {
            let arity = op.arity();
            call.check_count(arity, arity, if arity == 1 { "1" } else { "2" })?;
            call.check_keywords(&[])?;
            let inputs = self.lower_args(call.args)?;
            return Ok(Expr::call(Arc::new(Elementwise::new(op)), inputs));
        }

        let first = || -> Result<Expr, LowerError> {
            // Callers check the argument count first.
            match call.args.first() {
                Some(arg) => self.lower(arg),
                None => Err(call.invalid("x", "given")),
            }
        };

        let expr = match call.func {
            "sum" | "mean" | "max" => {
                call.check_count(1, 2, "1 or 2")?;
                call.check_keywords(&["axes", "keep_dims"])?;
                let op = match call.func {
                    "sum" => ReduceOp::Sum,
                    "mean" => ReduceOp::Mean,
                    _ => ReduceOp::Max,
                };
                let axes = call.int_list(1, "axes")?;
                let keep_dims = call.flag(2, "keep_dims")?;
                first()?.unary(Reduce::new(op, axes, keep_dims))
            }
            "softmax" => {
                call.check_count(1, 2, "1 or 2")?;
                call.check_keywords(&["axis"])?;
                let axis = call.int(1, "axis")?.unwrap_or(-1);
                first()?.unary(Softmax { axis })
            }
            "transpose" => {
                call.check_count(1, 2, "1 or 2")?;
                call.check_keywords(&["perm"])?;
                let perm = match call.int_list(1, "perm")? {
                    Some(perm) => Some(
                        perm.into_iter()
                            .map(usize::try_from)
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(|_| call.invalid("perm", "a list of non-negative integers"))?,
                    ),
                    None => None,
                };
                first()?.unary(Transpose { perm })
            }
            "reshape" => {
                call.check_count(2, 2, "2")?;
                call.check_keywords(&[])?;
                let inputs = self.lower_args(call.args)?;
                Expr::call(Arc::new(Reshape {}), inputs)
            }
            "specify_shape" => {
                call.check_count(2, 2, "2")?;
                call.check_keywords(&[])?;
                let Some(Ast::List(sizes)) = call.args.get(1) else {
                    return Err(call.invalid("shape", "a list of integers"));
                };
                let shape = sizes.iter().map(|&size| usize::try_from(size).ok()).collect();
                first()?.unary(SpecifyShape { shape })
            }
            "concat" => {
                if call.args.is_empty() {
                    return Err(LowerError::ArgCount {
                        func: call.func.to_string(),
                        expected: "at least 1",
                        actual: 0,
                    });
                }
                call.check_keywords(&["axis"])?;
                // Every positional argument is an input, so the axis can only
                // be given by name.
                let axis = call.int(usize::MAX, "axis")?.unwrap_or(0);
                let inputs = self.lower_args(call.args)?;
                Expr::call(Arc::new(Concat { axis }), inputs)
            }
            "matmul" => {
                call.check_count(2, 2, "2")?;
                call.check_keywords(&[])?;
                let inputs = self.lower_args(call.args)?;
                Expr::call(Arc::new(MatMul {}), inputs)
            }
            "shape" => {
                call.check_count(1, 1, "1")?;
                call.check_keywords(&[])?;
                first()?.unary(Shape {})
            }
            "shape_i" => {
                call.check_count(1, 2, "1 or 2")?;
                call.check_keywords(&["index"])?;
                let index = call
                    .int(1, "index")?
                    .and_then(|index| usize::try_from(index).ok())
                    .ok_or_else(|| call.invalid("index", "a non-negative integer"))?;
                first()?.unary(ShapeI { index })
            }
            "fill" => {
                call.check_count(1, 2, "1 or 2")?;
                call.check_keywords(&["value"])?;
                let value = match call.get(1, "value") {
                    None => 0.,
                    Some(Ast::Number(x)) => *x,
                    Some(Ast::Neg(x)) => match x.as_ref() {
                        Ast::Number(x) => -*x,
                        _ => return Err(call.invalid("value", "a number")),
                    },
                    Some(_) => return Err(call.invalid("value", "a number")),
                };
                first()?.unary(Fill { value })
            }
            "int" | "float" => {
                call.check_count(1, 1, "1")?;
                call.check_keywords(&[])?;
                let to = if call.func == "int" {
                    DataType::Int32
                } else {
                    DataType::Float
                };
                first()?.unary(Cast { to })
            }
            "identity" => {
                call.check_count(1, 1, "1")?;
                call.check_keywords(&[])?;
                first()?.unary(Identity)
            }
            _ => return Err(LowerError::UnknownFunction(call.func.to_string())),
        };
        Ok(expr)
    }

    fn lower_args(&self, args: &[Ast]) -> Result<Vec<Expr>, LowerError> {
        args.iter().map(|arg| self.lower(arg)).collect()
    }
}

/// Names of the functions accepted in expressions, for help output.
pub const FUNCTIONS: &str = "\
exp log log1p sqrt abs tanh sigmoid softplus neg maximum minimum pow
sum mean max (axes=[..], keep_dims=0) softmax (axis=-1)
transpose (perm=[..]) reshape (x, shape) specify_shape (x, [..])
concat (.., axis=0) matmul shape shape_i (index) fill (shape, value)
int float identity";

#[cfg(test)]
mod tests {
    use sten::graph::builder::Expr;
    use sten::graph::Node;
    use sten_testing::TestCases;

    use super::{LowerError, Lowering};
    use crate::parser::parse;

    /// Lower `expr` with inputs `x` and `y` and return the sorted names of
    /// the operators it uses.
    fn lower_op_names(expr: &str) -> Result<Vec<String>, LowerError> {
        let x = Expr::value("x");
        let y = Expr::value("y");
        let lowering = Lowering::new([("x", x.clone()), ("y", y.clone())]);
        let ast = parse(expr).unwrap();
        let out = lowering.lower(&ast)?;
        let graph = Expr::make_graph([x, y], [out]);
        let plan = graph
            .execution_plan(graph.input_ids(), graph.output_ids())
            .unwrap();
        let mut names: Vec<String> = plan
            .iter()
            .filter_map(|id| match graph.get_node(*id) {
                Some(Node::Operator(op)) => Some(op.operator().name().to_string()),
                _ => None,
            })
            .collect();
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_lower() {
        #[derive(Debug)]
        struct Case {
            expr: &'static str,
            ops: &'static [&'static str],
        }

        let cases = [
            Case {
                expr: "x",
                ops: &[],
            },
            Case {
                expr: "-x + y * 2",
                ops: &["Neg", "Mul", "Add"],
            },
            Case {
                expr: "x ^ 2 / y",
                ops: &["Pow", "Div"],
            },
            Case {
                expr: "sum(exp(x), axes=[-1])",
                ops: &["Exp", "ReduceSum"],
            },
            Case {
                expr: "max(x, 0, keep_dims=1)",
                ops: &["ReduceMax"],
            },
            Case {
                expr: "maximum(x, y)",
                ops: &["Maximum"],
            },
            Case {
                expr: "softmax(x)",
                ops: &["Softmax"],
            },
            Case {
                expr: "reshape(x, shape(y))",
                ops: &["Shape", "Reshape"],
            },
            Case {
                expr: "concat(x, y, axis=-1)",
                ops: &["Concat"],
            },
            Case {
                expr: "transpose(matmul(x, y), [1, 0])",
                ops: &["MatMul", "Transpose"],
            },
            Case {
                expr: "fill(shape(x), value=-1) + float(shape_i(y, 0))",
                ops: &["Shape", "Fill", "ShapeI", "Cast", "Add"],
            },
            Case {
                expr: "specify_shape(identity(x), [-1, 3])",
                ops: &["Identity", "SpecifyShape"],
            },
        ];

        cases.test_each(|case| {
            let ops = lower_op_names(case.expr).unwrap();
            let mut expected = case.ops.to_vec();
            expected.sort();
            assert_eq!(ops, expected);
        })
    }

    #[test]
    fn test_lower_errors() {
        #[derive(Debug)]
        struct Case {
            expr: &'static str,
            error: &'static str,
        }

        let cases = [
            Case {
                expr: "x + z",
                error: "\"z\" is not an input. Declare it with --input z",
            },
            Case {
                expr: "frobnicate(x)",
                error: "unknown function \"frobnicate\"",
            },
            Case {
                expr: "exp(x, y)",
                error: "exp() takes 1 positional arguments but 2 were given",
            },
            Case {
                expr: "sum(x, axis=0)",
                error: "sum() has no argument \"axis\"",
            },
            Case {
                expr: "softmax(x, axis=0.5)",
                error: "argument \"axis\" of softmax() must be an integer",
            },
            Case {
                expr: "shape_i(x)",
                error: "argument \"index\" of shape_i() must be a non-negative integer",
            },
            Case {
                expr: "transpose(x, [0, -1])",
                error: "argument \"perm\" of transpose() must be a list of non-negative integers",
            },
            Case {
                expr: "concat()",
                error: "concat() takes at least 1 positional arguments but 0 were given",
            },
        ];

        cases.test_each(|case| {
            let err = lower_op_names(case.expr).err().unwrap();
            assert_eq!(err.to_string(), case.error);
        })
    }
}
