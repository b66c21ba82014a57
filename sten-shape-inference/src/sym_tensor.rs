//! Tensors whose shapes, and for small integer tensors values, are symbolic.

use std::fmt;

use crate::sym_expr::{EvalError, SymExpr, SymbolMap};

/// Integer scalar or vector with known values.
#[derive(Clone, Eq, Hash, PartialEq)]
pub enum Constant {
    Scalar(i32),
    Vector(Vec<i32>),
}

impl Constant {
    pub fn ndim(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Vector(_) => 1,
        }
    }

    pub fn values(&self) -> &[i32] {
        match self {
            Self::Scalar(x) => std::slice::from_ref(x),
            Self::Vector(v) => v,
        }
    }

    pub fn into_vec(self) -> Vec<i32> {
        match self {
            Self::Scalar(x) => vec![x],
            Self::Vector(v) => v,
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(x) => write!(f, "{}", x),
            Self::Vector(v) => write!(f, "{:?}", v),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Repr {
    /// Scalar whose value is described by an expression.
    Scalar(SymExpr),
    /// Vector whose elements are described by expressions.
    Vector(Vec<SymExpr>),
    /// Tensor with a known rank and symbolic dimension sizes, but unknown
    /// values.
    Shape(Vec<SymExpr>),
    /// Nothing is known. The note records why, for debugging.
    Unknown(&'static str),
}

/// Tensor described by symbolic dimension sizes and optionally values.
///
/// Values are tracked for scalars and vectors so that shape computations
/// inside a graph (eg. `Reshape(x, Concat(ShapeI(x, 0), [-1]))`) can be
/// followed statically.
///
/// ```
/// use sten_shape_inference::{SymExpr, SymTensor};
///
/// let rows = SymExpr::from("rows");
/// let matrix = SymTensor::from_shape(vec![rows.clone(), 16.into()]);
/// assert_eq!(matrix.ndim(), Some(2));
/// assert_eq!(matrix.size(0), Some(rows.clone()));
/// assert_eq!(matrix.fixed_shape(), None);
///
/// let shape = SymTensor::from_vec(matrix.shape().unwrap().collect());
/// assert_eq!(shape.values(), Some([rows, 16.into()].as_slice()));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SymTensor(Repr);

impl SymTensor {
    /// Create a tensor about which nothing is known.
    pub fn unknown(note: &'static str) -> Self {
        Self(Repr::Unknown(note))
    }

    /// Create a tensor with a given shape and unknown values.
    pub fn from_shape(shape: Vec<SymExpr>) -> Self {
        Self(Repr::Shape(shape))
    }

    pub fn from_fixed_shape(shape: &[usize]) -> Self {
        Self(Repr::Shape(
            shape.iter().map(|&size| SymExpr::Value(size as i32)).collect(),
        ))
    }

    pub fn from_vec(values: Vec<SymExpr>) -> Self {
        Self(Repr::Vector(values))
    }

    pub fn from_scalar(value: SymExpr) -> Self {
        Self(Repr::Scalar(value))
    }

    /// Create a scalar or vector from known values.
    pub fn from_constant(value: &Constant) -> Self {
        match value {
            Constant::Scalar(x) => Self::from_scalar(SymExpr::Value(*x)),
            Constant::Vector(v) => Self::from_vec(v.iter().copied().map(SymExpr::Value).collect()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.0, Repr::Unknown(_))
    }

    /// Return the note attached to an unknown tensor.
    pub fn unknown_note(&self) -> Option<&'static str> {
        match self.0 {
            Repr::Unknown(note) => Some(note),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&SymExpr> {
        match &self.0 {
            Repr::Scalar(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[SymExpr]> {
        match &self.0 {
            Repr::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Return the values of this tensor if they are all known integers.
    pub fn to_constant(&self) -> Option<Constant> {
        match &self.0 {
            Repr::Scalar(x) => x.as_value().map(Constant::Scalar),
            Repr::Vector(v) => v
                .iter()
                .map(|x| x.as_value())
                .collect::<Option<Vec<_>>>()
                .map(Constant::Vector),
            Repr::Shape(_) | Repr::Unknown(_) => None,
        }
    }

    pub fn ndim(&self) -> Option<usize> {
        match &self.0 {
            Repr::Scalar(_) => Some(0),
            Repr::Vector(_) => Some(1),
            Repr::Shape(dims) => Some(dims.len()),
            Repr::Unknown(_) => None,
        }
    }

    /// Return the size of dimension `index`, or `None` if the rank is unknown
    /// or the index is out of bounds.
    pub fn size(&self, index: usize) -> Option<SymExpr> {
        match &self.0 {
            Repr::Vector(v) if index == 0 => Some(SymExpr::Value(v.len() as i32)),
            Repr::Shape(dims) => dims.get(index).cloned(),
            _ => None,
        }
    }

    /// Return an iterator over the dimension sizes, or `None` if the rank is
    /// unknown.
    pub fn shape(&self) -> Option<impl ExactSizeIterator<Item = SymExpr> + Clone + '_> {
        let dims: &[SymExpr] = match &self.0 {
            Repr::Scalar(_) => &[],
            Repr::Vector(v) => {
                return Some(ShapeIter::Vector(Some(v.len())));
            }
            Repr::Shape(dims) => dims,
            Repr::Unknown(_) => return None,
        };
        Some(ShapeIter::Dims(dims.iter()))
    }

    /// Return the shape if every dimension has a known size.
    pub fn fixed_shape(&self) -> Option<Vec<usize>> {
        self.shape()?
            .map(|dim| dim.as_value().and_then(|size| usize::try_from(size).ok()))
            .collect()
    }

    /// Evaluate the shape given concrete values for symbols.
    ///
    /// Returns `Ok(None)` if the rank is unknown.
    pub fn eval_shape(&self, symbols: &SymbolMap) -> Result<Option<Vec<usize>>, EvalError> {
        let Some(dims) = self.shape() else {
            return Ok(None);
        };
        dims.map(|dim| {
            let size = dim.eval(symbols)?;
            usize::try_from(size).map_err(|_| EvalError::Overflow)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
    }

    /// Return the symbolic values of a scalar or vector.
    pub fn values(&self) -> Option<&[SymExpr]> {
        match &self.0 {
            Repr::Scalar(x) => Some(std::slice::from_ref(x)),
            Repr::Vector(v) => Some(v),
            Repr::Shape(_) | Repr::Unknown(_) => None,
        }
    }

    /// Simplify every expression in this tensor.
    pub fn simplify(self) -> Self {
        let simplify_all =
            |exprs: Vec<SymExpr>| -> Vec<SymExpr> { exprs.iter().map(|x| x.simplify()).collect() };
        match self.0 {
            Repr::Scalar(x) => Self::from_scalar(x.simplify()),
            Repr::Vector(v) => Self::from_vec(simplify_all(v)),
            Repr::Shape(dims) => Self::from_shape(simplify_all(dims)),
            Repr::Unknown(_) => self,
        }
    }

    /// Return true if both tensors are known to have the same shape.
    ///
    /// This compares simplified dimension expressions, so it may return false
    /// for shapes that are equal but expressed differently.
    pub fn same_shape(&self, other: &SymTensor) -> bool {
        match (self.shape(), other.shape()) {
            (Some(a), Some(b)) => {
                a.len() == b.len() && a.zip(b).all(|(a, b)| a.simplify() == b.simplify())
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
enum ShapeIter<'a> {
    Dims(std::slice::Iter<'a, SymExpr>),
    Vector(Option<usize>),
}

impl Iterator for ShapeIter<'_> {
    type Item = SymExpr;

    fn next(&mut self) -> Option<SymExpr> {
        match self {
            Self::Dims(iter) => iter.next().cloned(),
            Self::Vector(len) => len.take().map(|len| SymExpr::Value(len as i32)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = match self {
            Self::Dims(iter) => iter.len(),
            Self::Vector(len) => len.is_some() as usize,
        };
        (len, Some(len))
    }
}

impl ExactSizeIterator for ShapeIter<'_> {}

impl fmt::Display for SymTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_list = |f: &mut fmt::Formatter<'_>, items: &[SymExpr]| {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, "]")
        };
        match &self.0 {
            Repr::Scalar(x) => write!(f, "value {}", x),
            Repr::Vector(v) => {
                write!(f, "values ")?;
                write_list(f, v)
            }
            Repr::Shape(dims) => write_list(f, dims),
            Repr::Unknown(_) => write!(f, "?"),
        }
    }
}

#[cfg(test)]
pub(crate) use tests::{sym_elems, sym_shape, sym_vec};

#[cfg(test)]
mod tests {
    use super::{Constant, SymExpr, SymTensor};
    use crate::sym_expr::SymbolMap;

    /// Create a `Vec<SymExpr>` from symbol names and values.
    macro_rules! sym_elems {
        ($($x:expr),* $(,)?) => {
            vec![$($crate::SymExpr::from($x)),*]
        };
    }

    /// Create a symbolic vector from symbol names and values.
    macro_rules! sym_vec {
        ($($x:expr),* $(,)?) => {
            $crate::SymTensor::from_vec(vec![$($crate::SymExpr::from($x)),*])
        };
    }

    /// Create a tensor with a symbolic shape.
    macro_rules! sym_shape {
        ($($x:expr),* $(,)?) => {
            $crate::SymTensor::from_shape(vec![$($crate::SymExpr::from($x)),*])
        };
    }

    pub(crate) use {sym_elems, sym_shape, sym_vec};

    #[test]
    fn test_scalar() {
        let x = SymTensor::from_scalar("x".into());
        assert_eq!(x.ndim(), Some(0));
        assert_eq!(x.size(0), None);
        assert_eq!(x.shape().unwrap().len(), 0);
        assert_eq!(x.values(), Some(["x".into()].as_slice()));
        assert_eq!(x.to_constant(), None);
    }

    #[test]
    fn test_vector() {
        let v = sym_vec!("x", 2);
        assert_eq!(v.ndim(), Some(1));
        assert_eq!(v.size(0), Some(2.into()));
        assert_eq!(v.size(1), None);
        assert_eq!(v.shape().unwrap().collect::<Vec<_>>(), sym_elems!(2));
        assert_eq!(v.fixed_shape(), Some(vec![2]));

        let c = sym_vec!(3, 4);
        assert_eq!(c.to_constant(), Some(Constant::Vector(vec![3, 4])));
        assert_eq!(SymTensor::from_constant(&Constant::Vector(vec![3, 4])), c);
    }

    #[test]
    fn test_tensor_with_shape() {
        let x = sym_shape!("batch", 2);
        assert_eq!(x.ndim(), Some(2));
        assert_eq!(x.size(0), Some("batch".into()));
        assert_eq!(x.size(2), None);
        assert_eq!(x.values(), None);
        assert_eq!(x.fixed_shape(), None);
        assert_eq!(x.to_string(), "[batch, 2]");

        let symbols: SymbolMap = [("batch", 5)].into_iter().collect();
        assert_eq!(x.eval_shape(&symbols), Ok(Some(vec![5, 2])));
        assert!(x.eval_shape(&SymbolMap::new()).is_err());
    }

    #[test]
    fn test_unknown() {
        let x = SymTensor::unknown("missing input");
        assert!(x.is_unknown());
        assert_eq!(x.unknown_note(), Some("missing input"));
        assert!(x.shape().is_none());
        assert_eq!(x.eval_shape(&SymbolMap::new()), Ok(None));
        assert_eq!(x.to_string(), "?");
    }

    #[test]
    fn test_simplify() {
        let matrix = SymTensor::from_shape(vec![
            SymExpr::from("rows") + SymExpr::from(0),
            SymExpr::from("cols") * SymExpr::from(1),
        ])
        .simplify();
        assert_eq!(matrix, sym_shape!("rows", "cols"));

        let v = sym_vec!(SymExpr::from(2) + SymExpr::from(3)).simplify();
        assert_eq!(v.to_constant(), Some(Constant::Vector(vec![5])));
    }

    #[test]
    fn test_same_shape() {
        let a = sym_shape!("n", 4);
        let b = SymTensor::from_shape(vec![SymExpr::from("n") * SymExpr::from(1), 4.into()]);
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&sym_shape!("m", 4)));
        assert!(!a.same_shape(&sym_shape!("n", 4, 1)));
        assert!(!a.same_shape(&SymTensor::unknown("unknown")));
    }
}
