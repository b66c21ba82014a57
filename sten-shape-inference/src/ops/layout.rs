use crate::infer_shapes::{resolve_axis, InferShapes, InferShapesError};
use crate::sym_expr::SymExpr;
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

fn product(dims: &[SymExpr]) -> SymExpr {
    dims.iter()
        .fold(SymExpr::Value(1), |prod, dim| prod * dim.clone())
        .simplify()
}

/// Reshape operator.
///
/// The second input is the target shape. At most one entry may be `-1`, in
/// which case its size is inferred from the number of elements.
pub struct Reshape;

impl InferShapes for Reshape {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [data, shape] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };

        let Some(target) = shape.values() else {
            // Rank is known if the length of the shape is.
            let out = match shape.size(0).and_then(|len| len.as_value()) {
                Some(len) if len >= 0 => {
                    SymTensor::from_shape((0..len).map(|_| sym_gen.gen_positive()).collect())
                }
                _ => SymTensor::unknown("unknown target shape"),
            };
            return Ok(vec![out]);
        };

        let infer_pos: Vec<usize> = target
            .iter()
            .enumerate()
            .filter(|(_, size)| size.as_value() == Some(-1))
            .map(|(i, _)| i)
            .collect();
        if infer_pos.len() > 1 || target.iter().any(|s| matches!(s.as_value(), Some(v) if v < -1))
        {
            return Err(InferShapesError::InvalidValue);
        }

        let data_dims: Option<Vec<SymExpr>> = data.shape().map(|dims| dims.collect());
        let mut out_shape = target.to_vec();

        if let Some(&pos) = infer_pos.first() {
            out_shape[pos] = match &data_dims {
                Some(data_dims) => {
                    let known: Vec<_> = target
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != pos)
                        .map(|(_, s)| s.clone())
                        .collect();
                    let (total, rest) = (product(data_dims), product(&known));
                    if let (Some(t), Some(r)) = (total.as_value(), rest.as_value()) {
                        if r == 0 || t % r != 0 {
                            return Err(InferShapesError::IncompatibleShapes);
                        }
                    }
                    (total / rest).simplify()
                }
                None => sym_gen.gen_positive(),
            };
        } else if let Some(data_dims) = &data_dims {
            let (total, new_total) = (product(data_dims), product(&out_shape));
            if let (Some(a), Some(b)) = (total.as_value(), new_total.as_value()) {
                if a != b {
                    return Err(InferShapesError::IncompatibleShapes);
                }
            }
        }

        // Reshaping a symbolic vector to a scalar or vector keeps its values.
        if let Some(values) = data.values() {
            match out_shape.as_slice() {
                [] if values.len() == 1 => {
                    return Ok(vec![SymTensor::from_scalar(values[0].clone())]);
                }
                [len] if len.as_value() == Some(values.len() as i32) => {
                    return Ok(vec![SymTensor::from_vec(values.to_vec())]);
                }
                _ => {}
            }
        }

        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

/// Transpose operator. `perm` defaults to reversing the dimensions.
pub struct Transpose<'a> {
    pub perm: Option<&'a [usize]>,
}

impl InferShapes for Transpose<'_> {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [input] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };

        let Some(dims) = input.shape() else {
            let out = match self.perm {
                Some(perm) => {
                    SymTensor::from_shape(perm.iter().map(|_| sym_gen.gen_positive()).collect())
                }
                None => SymTensor::unknown("unknown input shape"),
            };
            return Ok(vec![out]);
        };
        let dims: Vec<_> = dims.collect();

        let out_shape = match self.perm {
            Some(perm) => {
                if perm.len() != dims.len() {
                    return Err(InferShapesError::IncorrectRank);
                }
                let mut seen = vec![false; dims.len()];
                for &axis in perm {
                    if axis >= dims.len() || seen[axis] {
                        return Err(InferShapesError::InvalidValue);
                    }
                    seen[axis] = true;
                }
                perm.iter().map(|&axis| dims[axis].clone()).collect()
            }
            None => dims.into_iter().rev().collect(),
        };
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

/// Concatenation along an axis.
pub struct Concat {
    pub axis: i32,
}

impl InferShapes for Concat {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        sym_gen: &mut SymbolGen,
    ) -> Result<Vec<SymTensor>, InferShapesError> {
        let [first, rest @ ..] = inputs else {
            return Err(InferShapesError::IncorrectInputCount);
        };
        let Some(first_dims) = first.shape() else {
            return Ok(vec![SymTensor::unknown("unknown input shape")]);
        };
        let axis = resolve_axis(first_dims.len(), self.axis)?;

        // Concatenating symbolic vectors produces a symbolic vector.
        if inputs.iter().all(|x| x.as_vector().is_some()) {
            let values = inputs
                .iter()
                .filter_map(|x| x.as_vector())
                .flat_map(|v| v.iter().cloned())
                .collect();
            return Ok(vec![SymTensor::from_vec(values)]);
        }

        let mut out_shape: Vec<_> = first_dims.collect();
        for input in rest {
            let Some(dims) = input.shape() else {
                out_shape[axis] = (out_shape[axis].clone() + sym_gen.gen_positive()).simplify();
                continue;
            };
            let dims: Vec<_> = dims.collect();
            if dims.len() != out_shape.len() {
                return Err(InferShapesError::IncorrectRank);
            }
            for (i, dim) in dims.into_iter().enumerate() {
                if i == axis {
                    out_shape[i] = (out_shape[i].clone() + dim).simplify();
                } else if let (Some(a), Some(b)) = (out_shape[i].as_value(), dim.as_value()) {
                    if a != b {
                        return Err(InferShapesError::IncompatibleShapes);
                    }
                }
            }
        }
        Ok(vec![SymTensor::from_shape(out_shape)])
    }
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{Concat, Reshape, Transpose};
    use crate::infer_shapes::{InferShapes, InferShapesError};
    use crate::sym_expr::SymExpr;
    use crate::sym_gen::SymbolGen;
    use crate::sym_tensor::{sym_shape, sym_vec, SymTensor};

    #[test]
    fn test_reshape() {
        #[derive(Debug)]
        struct Case {
            data: SymTensor,
            shape: SymTensor,
            expected: Result<SymTensor, InferShapesError>,
        }

        let cases = [
            Case {
                data: sym_shape!(2, 3, 4),
                shape: sym_vec!(6, 4),
                expected: Ok(sym_shape!(6, 4)),
            },
            Case {
                data: sym_shape!(2, 3, 4),
                shape: sym_vec!(-1, 4),
                expected: Ok(sym_shape!(6, 4)),
            },
            Case {
                data: sym_shape!("batch", 3, 4),
                shape: sym_vec!("batch", -1),
                expected: Ok(sym_shape!("batch", 12)),
            },
            Case {
                data: sym_shape!("batch", "seq", 8),
                shape: sym_vec!(-1, 8),
                expected: Ok(sym_shape!(SymExpr::from("batch") * SymExpr::from("seq"), 8)),
            },
            Case {
                data: SymTensor::unknown("test"),
                shape: sym_vec!(-1, 8),
                expected: Ok(sym_shape!("unknown_1", 8)),
            },
            Case {
                data: sym_shape!(2, 3),
                shape: SymTensor::from_shape(vec![3.into()]),
                expected: Ok(sym_shape!("unknown_1", "unknown_2", "unknown_3")),
            },
            Case {
                data: sym_vec!("n"),
                shape: sym_vec!(),
                expected: Ok(SymTensor::from_scalar("n".into())),
            },
            Case {
                data: sym_shape!(2, 3),
                shape: sym_vec!(-1, -1),
                expected: Err(InferShapesError::InvalidValue),
            },
            Case {
                data: sym_shape!(2, 3),
                shape: sym_vec!(4, 2),
                expected: Err(InferShapesError::IncompatibleShapes),
            },
            Case {
                data: sym_shape!(2, 3),
                shape: sym_vec!(-1, 4),
                expected: Err(InferShapesError::IncompatibleShapes),
            },
        ];

        cases.test_each(|case| {
            let mut sym_gen = SymbolGen::new();
            let out = Reshape
                .infer_shapes(&[case.data.clone(), case.shape.clone()], &mut sym_gen)
                .map(|mut out| out.remove(0));
            assert_eq!(out, case.expected.clone());
        });
    }

    #[test]
    fn test_transpose() {
        let mut sym_gen = SymbolGen::new();

        let op = Transpose {
            perm: Some(&[0, 2, 1]),
        };
        let out = op.infer_shapes(&[sym_shape!("b", 3, 4)], &mut sym_gen).unwrap();
        assert_eq!(out, [sym_shape!("b", 4, 3)]);

        let op = Transpose { perm: None };
        let out = op.infer_shapes(&[sym_shape!("b", 3, 4)], &mut sym_gen).unwrap();
        assert_eq!(out, [sym_shape!(4, 3, "b")]);

        let op = Transpose {
            perm: Some(&[0, 0]),
        };
        let err = op.infer_shapes(&[sym_shape!(3, 4)], &mut sym_gen).err();
        assert_eq!(err, Some(InferShapesError::InvalidValue));

        let op = Transpose { perm: Some(&[0]) };
        let err = op.infer_shapes(&[sym_shape!(3, 4)], &mut sym_gen).err();
        assert_eq!(err, Some(InferShapesError::IncorrectRank));
    }

    #[test]
    fn test_concat() {
        let mut sym_gen = SymbolGen::new();
        let op = Concat { axis: 1 };

        let out = op
            .infer_shapes(&[sym_shape!("batch", 16), sym_shape!("batch", 8)], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_shape!("batch", 24)]);

        let out = op
            .infer_shapes(&[sym_shape!(2, "foo"), sym_shape!(2, "bar")], &mut sym_gen)
            .unwrap();
        assert_eq!(
            out,
            [sym_shape!(2, SymExpr::from("bar") + SymExpr::from("foo"))]
        );

        let err = op
            .infer_shapes(&[sym_shape!(2, 3), sym_shape!(4, 3)], &mut sym_gen)
            .err();
        assert_eq!(err, Some(InferShapesError::IncompatibleShapes));

        // Concatenation of symbolic vectors.
        let op = Concat { axis: 0 };
        let out = op
            .infer_shapes(&[sym_vec!("batch", 3), sym_vec!(-1)], &mut sym_gen)
            .unwrap();
        assert_eq!(out, [sym_vec!("batch", 3, -1)]);
    }
}
