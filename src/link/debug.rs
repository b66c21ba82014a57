use sten_shape_inference::{EvalError, SymExpr, SymbolMap};

use crate::graph::NodeId;
use crate::infer_shapes::ShapeMap;
use crate::value::Value;

/// Absolute tolerance when comparing native and reference outputs.
pub const ATOL: f32 = 1e-5;

/// Relative tolerance when comparing native and reference outputs.
pub const RTOL: f32 = 1e-4;

fn floats_close(x: f32, y: f32, atol: f32, rtol: f32) -> bool {
    (x.is_nan() && y.is_nan()) || x == y || (x - y).abs() <= atol + rtol * y.abs()
}

/// Check that two values have the same type and shape and close elements.
///
/// Integer elements must match exactly. NaNs compare equal to each other.
pub fn compare_values(actual: &Value, expected: &Value, atol: f32, rtol: f32) -> Result<(), String> {
    if actual.dtype() != expected.dtype() {
        return Err(format!(
            "type {} does not match expected {}",
            actual.dtype(),
            expected.dtype()
        ));
    }
    if actual.shape() != expected.shape() {
        return Err(format!(
            "shape {:?} does not match expected {:?}",
            actual.shape(),
            expected.shape()
        ));
    }
    let mismatch = match (actual, expected) {
        (Value::FloatTensor(a), Value::FloatTensor(b)) => a
            .data()
            .iter()
            .zip(b.data())
            .position(|(x, y)| !floats_close(*x, *y, atol, rtol))
            .map(|i| format!("element {} is {} but expected {}", i, a.data()[i], b.data()[i])),
        (Value::Int32Tensor(a), Value::Int32Tensor(b)) => a
            .data()
            .iter()
            .zip(b.data())
            .position(|(x, y)| x != y)
            .map(|i| format!("element {} is {} but expected {}", i, a.data()[i], b.data()[i])),
        _ => None,
    };
    match mismatch {
        Some(msg) => Err(msg),
        None => Ok(()),
    }
}

/// Checks the shapes of runtime values against static shape inference.
///
/// Symbols in inferred shapes are bound the first time a dimension
/// consisting of just that symbol is observed. Later observations must be
/// consistent with the bindings.
pub struct ShapeChecker<'a> {
    shapes: &'a ShapeMap,
    symbols: SymbolMap,
}

impl<'a> ShapeChecker<'a> {
    pub fn new(shapes: &'a ShapeMap) -> Self {
        ShapeChecker {
            shapes,
            symbols: SymbolMap::new(),
        }
    }

    /// Check the shape, and for small int tensors the values, of a runtime
    /// value.
    pub fn observe(&mut self, id: NodeId, value: &Value) -> Result<(), String> {
        let shapes = self.shapes;
        let Some(info) = shapes.get(id) else {
            return Ok(());
        };

        if let Some(dims) = info.shape() {
            let dims: Vec<SymExpr> = dims.collect();
            if dims.len() != value.ndim() {
                return Err(format!(
                    "rank {} does not match inferred shape {}",
                    value.ndim(),
                    info
                ));
            }
            for (dim, &size) in dims.iter().zip(value.shape()) {
                self.check_size(dim, size as i32)
                    .map_err(|expected| match expected {
                        Some(expected) => format!(
                            "shape {:?} does not match inferred shape {} (expected size {} for {})",
                            value.shape(),
                            info,
                            expected,
                            dim
                        ),
                        None => format!(
                            "shape {:?} does not match inferred shape {}",
                            value.shape(),
                            info
                        ),
                    })?;
            }
        }

        if let (Some(values), Value::Int32Tensor(t)) = (info.values(), value) {
            if values.len() == t.len() {
                for (expr, &actual) in values.iter().zip(t.data()) {
                    self.check_size(expr, actual).map_err(|_| {
                        format!("values {:?} do not match inferred values {}", t.data(), info)
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Check a size against an expression, learning the binding if `expr`
    /// is an unbound symbol. On mismatch, returns the expected size if it
    /// could be evaluated.
    fn check_size(&mut self, expr: &SymExpr, actual: i32) -> Result<(), Option<i32>> {
        if let SymExpr::Var(sym) = expr {
            if self.symbols.get(&sym.name).is_none() {
                if sym.positive && actual < 0 {
                    return Err(None);
                }
                self.symbols.insert(&sym.name, actual);
                return Ok(());
            }
        }
        match expr.eval(&self.symbols) {
            Ok(expected) if expected == actual => Ok(()),
            Ok(expected) => Err(Some(expected)),
            // Sizes that depend on symbols not yet bound can't be checked.
            Err(EvalError::UnknownSymbol(_)) => Ok(()),
            Err(_) => Err(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{compare_values, ShapeChecker};
    use crate::graph::builder::{dims, Expr};
    use crate::infer_shapes::{infer_shapes, InferOptions};
    use crate::ops::{Elementwise, ScalarOp, Shape};
    use crate::tensor::Tensor;
    use crate::value::{DataType, Value};

    #[test]
    fn test_compare_values() {
        let a: Value = Tensor::from_vec(vec![1.0, f32::NAN, 3.0]).into();
        let b: Value = Tensor::from_vec(vec![1.000001, f32::NAN, 3.0]).into();
        assert!(compare_values(&a, &b, 1e-5, 1e-4).is_ok());

        let c: Value = Tensor::from_vec(vec![1.0, f32::NAN, 3.1]).into();
        assert_eq!(
            compare_values(&a, &c, 1e-5, 1e-4).err().as_deref(),
            Some("element 2 is 3 but expected 3.1")
        );

        let d: Value = Tensor::from_vec(vec![1, 2, 3]).into();
        assert!(compare_values(&a, &d, 1e-5, 1e-4).is_err());

        let e: Value = Tensor::<f32>::zeros(&[3, 1]).into();
        assert_eq!(
            compare_values(&a, &e, 1e-5, 1e-4).err().as_deref(),
            Some("shape [3] does not match expected [3, 1]")
        );
    }

    #[test]
    fn test_shape_checker() {
        let x = Expr::value_with_info("x", DataType::Float, &dims!["n", 2]);
        let y = x.unary(Elementwise::new(ScalarOp::Exp));
        let s = y.unary(Shape {});
        let graph = Expr::make_graph([x], [y, s]);
        let shapes = infer_shapes(&graph, &InferOptions::default()).unwrap();
        let [x_id, y_id, s_id] = [
            graph.input_ids()[0],
            graph.output_ids()[0],
            graph.output_ids()[1],
        ];

        let mut checker = ShapeChecker::new(&shapes);
        let x_val: Value = Tensor::<f32>::zeros(&[5, 2]).into();
        assert!(checker.observe(x_id, &x_val).is_ok());
        assert!(checker.observe(y_id, &x_val).is_ok());

        // `n` is now bound to 5.
        let wrong: Value = Tensor::<f32>::zeros(&[4, 2]).into();
        assert!(checker.observe(y_id, &wrong).is_err());

        let shape_val: Value = Tensor::from_vec(vec![5, 2]).into();
        assert!(checker.observe(s_id, &shape_val).is_ok());
        let shape_val: Value = Tensor::from_vec(vec![4, 2]).into();
        assert!(checker.observe(s_id, &shape_val).is_err());

        let wrong_rank: Value = Tensor::<f32>::zeros(&[10]).into();
        assert!(checker.observe(y_id, &wrong_rank).is_err());
    }
}
