use crate::infer_shapes::{BinaryOp, InferShapes, InferShapesError};
use crate::sym_expr::SymExpr;
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl ArithOp {
    fn apply(self, x: &SymExpr, y: &SymExpr) -> SymExpr {
        let (x, y) = (x.clone(), y.clone());
        let expr = match self {
            Self::Add => x + y,
            Self::Sub => x - y,
            Self::Mul => x * y,
            Self::Div => x / y,
            Self::Max => x.max(&y),
            Self::Min => x.min(&y),
        };
        expr.simplify()
    }
}

/// Integer arithmetic which propagates symbolic values.
///
/// When both inputs are scalars or vectors with symbolic values, the output
/// values are computed symbolically. For example adding `[batch, 1]` and
/// `[0, seq]` gives `[batch, 1 + seq]`. Otherwise only the broadcast output
/// shape is inferred.
pub struct Arith {
    pub op: ArithOp,
}

impl InferShapes for Arith {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [lhs, rhs] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };

        if let (Some(x), Some(y)) = (lhs.as_scalar(), rhs.as_scalar()) {
            return Ok(vec![SymTensor::from_scalar(self.op.apply(x, y))]);
        }

        if let (Some(xs), Some(ys)) = (lhs.values(), rhs.values()) {
            let values: Option<Vec<SymExpr>> = match (xs.len(), ys.len()) {
                (n, m) if n == m => Some(xs.iter().zip(ys).map(|(x, y)| self.op.apply(x, y)).collect()),
                (1, _) => Some(ys.iter().map(|y| self.op.apply(&xs[0], y)).collect()),
                (_, 1) => Some(xs.iter().map(|x| self.op.apply(x, &ys[0])).collect()),
                _ => None,
            };
            let Some(values) = values else {
                return Err(InferShapesError::IncompatibleShapes);
            };
            return Ok(vec![SymTensor::from_vec(values)]);
        }

        BinaryOp.infer_shapes(inputs, sym_gen)
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{Arith, ArithOp};
    use crate::infer_shapes::{InferShapes, InferShapesError};
    use crate::sym_expr::SymExpr;
    use crate::sym_gen::SymbolGen;
    use crate::sym_tensor::{sym_shape, sym_vec, SymTensor};

    #[test]
    fn test_arith() {
        #[derive(Debug)]
        struct Case {
            op: ArithOp,
            lhs: SymTensor,
            rhs: SymTensor,
            expected: SymTensor,
        }

        let cases = [
            Case {
                op: ArithOp::Add,
                lhs: SymTensor::from_scalar(6.into()),
                rhs: SymTensor::from_scalar(5.into()),
                expected: SymTensor::from_scalar(11.into()),
            },
            Case {
                op: ArithOp::Add,
                lhs: sym_vec!(5, "foo"),
                rhs: sym_vec!(6, "bar"),
                expected: sym_vec!(11, SymExpr::from("bar") + SymExpr::from("foo")),
            },
            Case {
                op: ArithOp::Sub,
                lhs: sym_vec!("n", 4),
                rhs: sym_vec!(1),
                expected: sym_vec!(SymExpr::from("n") - SymExpr::from(1), 3),
            },
            Case {
                op: ArithOp::Mul,
                lhs: sym_vec!("batch"),
                rhs: SymTensor::from_scalar(2.into()),
                expected: sym_vec!(SymExpr::from(2) * SymExpr::from("batch")),
            },
            Case {
                op: ArithOp::Div,
                lhs: sym_vec!(16),
                rhs: sym_vec!(2),
                expected: sym_vec!(8),
            },
            Case {
                op: ArithOp::Div,
                lhs: SymTensor::from_scalar(SymExpr::from("n") * SymExpr::from(4)),
                rhs: SymTensor::from_scalar(4.into()),
                expected: SymTensor::from_scalar("n".into()),
            },
            Case {
                op: ArithOp::Max,
                lhs: sym_vec!(3, 1),
                rhs: sym_vec!(2),
                expected: sym_vec!(3, 2),
            },
            Case {
                op: ArithOp::Mul,
                lhs: sym_shape!(5, "foo"),
                rhs: sym_shape!(1, "foo"),
                expected: sym_shape!(5, "foo"),
            },
        ];

        cases.test_each(|case| {
            let mut sym_gen = SymbolGen::new();
            let op = Arith { op: case.op };
            let out = op
                .infer_shapes(&[case.lhs.clone(), case.rhs.clone()], &mut sym_gen)
                .unwrap();
            assert_eq!(out, [case.expected.clone()]);
        });
    }

    #[test]
    fn test_arith_mismatched_vectors() {
        let mut sym_gen = SymbolGen::new();
        let op = Arith { op: ArithOp::Add };
        let err = op
            .infer_shapes(&[sym_vec!(1, 2), sym_vec!(1, 2, 3)], &mut sym_gen)
            .err();
        assert_eq!(err, Some(InferShapesError::IncompatibleShapes));
    }
}
