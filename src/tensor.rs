//! Dense, row-major tensors with shared, copy-on-write storage.

use std::fmt;
use std::iter::repeat;
use std::sync::Arc;

use smallvec::SmallVec;

/// Shape of a tensor. Most tensors have 4 or fewer dimensions.
pub type Shape = SmallVec<[usize; 4]>;

/// Error returned when the length of a data buffer does not match the
/// product of a shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataLenError {
    pub shape: Vec<usize>,
    pub len: usize,
}

impl fmt::Display for DataLenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data length {} does not match shape {:?}",
            self.len, self.shape
        )
    }
}

impl std::error::Error for DataLenError {}

/// An n-dimensional array with a contiguous, row-major layout.
///
/// The data buffer is reference counted, so cloning a tensor is cheap.
/// Mutable access via [`data_mut`](Tensor::data_mut) copies the buffer first
/// if it is shared.
#[derive(Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Shape,
    data: Arc<Vec<T>>,
}

impl<T> Tensor<T> {
    /// Create a tensor from a shape and data buffer.
    ///
    /// Panics if the length of `data` does not match the shape. Use
    /// [`try_from_data`](Tensor::try_from_data) for a fallible version.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        match Self::try_from_data(shape, data) {
            Ok(tensor) => tensor,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_data(shape: &[usize], data: Vec<T>) -> Result<Tensor<T>, DataLenError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(DataLenError {
                shape: shape.to_vec(),
                len: data.len(),
            });
        }
        Ok(Tensor {
            shape: SmallVec::from_slice(shape),
            data: Arc::new(data),
        })
    }

    /// Create a tensor with zero dimensions.
    pub fn from_scalar(value: T) -> Tensor<T> {
        Tensor {
            shape: SmallVec::new(),
            data: Arc::new(vec![value]),
        }
    }

    /// Create a vector from a list of elements.
    pub fn from_vec(data: Vec<T>) -> Tensor<T> {
        Tensor {
            shape: SmallVec::from_slice(&[data.len()]),
            data: Arc::new(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Return the single element of a tensor with one element.
    pub fn item(&self) -> Option<&T> {
        match self.data.as_slice() {
            [x] => Some(x),
            _ => None,
        }
    }

    /// Return a tensor with the same data and a different shape, or `None`
    /// if the element count differs.
    pub fn reshaped(&self, shape: &[usize]) -> Option<Tensor<T>> {
        if shape.iter().product::<usize>() != self.len() {
            return None;
        }
        Some(Tensor {
            shape: SmallVec::from_slice(shape),
            data: self.data.clone(),
        })
    }

    /// Return true if the data buffer is not shared with another tensor.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Return true if two tensors share the same data buffer.
    pub fn shares_data(&self, other: &Tensor<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: Arc::new(self.data.iter().map(f).collect()),
        }
    }
}

impl<T: Clone> Tensor<T> {
    /// Create a tensor with all elements set to `value`.
    pub fn full(shape: &[usize], value: T) -> Tensor<T> {
        let len = shape.iter().product();
        Tensor {
            shape: SmallVec::from_slice(shape),
            data: Arc::new(vec![value; len]),
        }
    }

    /// Return a mutable view of the data, copying it first if shared.
    pub fn data_mut(&mut self) -> &mut [T] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Consume the tensor and return its data, copying it if shared.
    pub fn into_data(self) -> Vec<T> {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    /// Return a copy of this tensor broadcast to `shape`, or `None` if the
    /// shapes are not compatible.
    pub fn broadcast_to(&self, shape: &[usize]) -> Option<Tensor<T>> {
        if self.shape() == shape {
            return Some(self.clone());
        }
        if !can_broadcast_to(self.shape(), shape) {
            return None;
        }
        let data = broadcast_offsets(self.shape(), shape)
            .map(|offset| self.data[offset].clone())
            .collect();
        Some(Tensor {
            shape: SmallVec::from_slice(shape),
            data: Arc::new(data),
        })
    }
}

impl<T: Clone + Default> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Tensor<T> {
        Self::full(shape, T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape.as_slice())
            .field("data", &self.data.as_slice())
            .finish()
    }
}

macro_rules! impl_from_scalar {
    ($type:ty) => {
        impl From<$type> for Tensor<$type> {
            fn from(value: $type) -> Tensor<$type> {
                Tensor::from_scalar(value)
            }
        }

        impl From<Vec<$type>> for Tensor<$type> {
            fn from(data: Vec<$type>) -> Tensor<$type> {
                Tensor::from_vec(data)
            }
        }
    };
}
impl_from_scalar!(f32);
impl_from_scalar!(i32);

/// Given the shapes of two inputs to a binary operation, return the shape
/// that results from broadcasting them following NumPy rules, or `None` if
/// the shapes are not compatible.
///
/// Shapes are left-padded with 1s to the same length, then each pair of
/// dimensions must be equal or one of them must be 1.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());

    let a_iter = a.iter().copied().rev().chain(repeat(1).take(a_pad));
    let b_iter = b.iter().copied().rev().chain(repeat(1).take(b_pad));

    let mut result = SmallVec::with_capacity(a.len().max(b.len()));
    for (a, b) in a_iter.zip(b_iter) {
        if a == b {
            result.push(a);
        } else if a == 1 {
            result.push(b);
        } else if b == 1 {
            result.push(a);
        } else {
            return None;
        }
    }
    result.reverse();

    Some(result)
}

/// Return true if a tensor of shape `from` can be broadcast to `to`.
pub fn can_broadcast_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let pad = to.len() - from.len();
    from.iter()
        .zip(&to[pad..])
        .all(|(&from, &to)| from == to || from == 1)
}

/// Return the row-major strides of a contiguous tensor.
pub fn strides(shape: &[usize]) -> Shape {
    let mut strides: Shape = SmallVec::from_elem(0, shape.len());
    let mut stride = 1;
    for (i, &size) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride *= size;
    }
    strides
}

/// Iterator over the offsets into a contiguous buffer of shape `from` that
/// are read when it is broadcast to shape `to`, in row-major order of `to`.
///
/// Created by [`broadcast_offsets`].
pub struct BroadcastOffsets {
    /// Strides of the source, with zero for broadcast dimensions.
    strides: Shape,
    to_shape: Shape,
    index: Shape,
    offset: usize,
    remaining: usize,
}

/// Return the offsets into a buffer of shape `from` to read when it is
/// broadcast to shape `to`.
///
/// `from` must be broadcastable to `to` (see [`can_broadcast_to`]).
pub fn broadcast_offsets(from: &[usize], to: &[usize]) -> BroadcastOffsets {
    debug_assert!(can_broadcast_to(from, to));

    let pad = to.len().saturating_sub(from.len());
    let from_strides = strides(from);
    let strides = (0..to.len())
        .map(|i| {
            if i < pad || from[i - pad] == 1 {
                0
            } else {
                from_strides[i - pad]
            }
        })
        .collect();

    BroadcastOffsets {
        strides,
        to_shape: SmallVec::from_slice(to),
        index: SmallVec::from_elem(0, to.len()),
        offset: 0,
        remaining: to.iter().product(),
    }
}

impl Iterator for BroadcastOffsets {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.offset;
        self.remaining -= 1;

        // Advance the index like an odometer, innermost dimension first.
        for dim in (0..self.index.len()).rev() {
            self.index[dim] += 1;
            self.offset += self.strides[dim];
            if self.index[dim] < self.to_shape[dim] {
                break;
            }
            self.offset -= self.strides[dim] * self.index[dim];
            self.index[dim] = 0;
        }

        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BroadcastOffsets {}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{broadcast_offsets, broadcast_shapes, can_broadcast_to, strides, Tensor};

    #[test]
    fn test_from_data() {
        let x = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]);
        assert_eq!(x.shape(), &[2, 3]);
        assert_eq!(x.ndim(), 2);
        assert_eq!(x.len(), 6);

        let err = Tensor::try_from_data(&[2, 2], vec![1, 2, 3]).err().unwrap();
        assert_eq!(err.to_string(), "data length 3 does not match shape [2, 2]");
    }

    #[test]
    fn test_copy_on_write() {
        let x = Tensor::from_vec(vec![1, 2, 3]);
        let mut y = x.clone();
        assert!(x.shares_data(&y));
        assert!(!y.is_unique());

        y.data_mut()[0] = 10;
        assert!(!x.shares_data(&y));
        assert_eq!(x.data(), &[1, 2, 3]);
        assert_eq!(y.data(), &[10, 2, 3]);
        assert!(y.is_unique());
    }

    #[test]
    fn test_item_and_reshape() {
        let x = Tensor::from_scalar(5.0f32);
        assert_eq!(x.item(), Some(&5.0));
        assert_eq!(Tensor::from_vec(vec![1, 2]).item(), None);

        let y = Tensor::<f32>::zeros(&[2, 3]);
        let z = y.reshaped(&[3, 2]).unwrap();
        assert!(z.shares_data(&y));
        assert!(y.reshaped(&[4]).is_none());
    }

    #[test]
    fn test_broadcast_shapes() {
        #[derive(Debug)]
        struct Case {
            a: Vec<usize>,
            b: Vec<usize>,
            expected: Option<Vec<usize>>,
        }

        let cases = [
            Case {
                a: vec![2, 3],
                b: vec![2, 3],
                expected: Some(vec![2, 3]),
            },
            Case {
                a: vec![4, 1, 3],
                b: vec![5, 1],
                expected: Some(vec![4, 5, 3]),
            },
            Case {
                a: vec![],
                b: vec![2],
                expected: Some(vec![2]),
            },
            Case {
                a: vec![2, 3],
                b: vec![3, 2],
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let shape = broadcast_shapes(&case.a, &case.b).map(|s| s.to_vec());
            assert_eq!(shape, case.expected);
        });
    }

    #[test]
    fn test_broadcast_offsets() {
        assert!(can_broadcast_to(&[3], &[2, 3]));
        assert!(!can_broadcast_to(&[2], &[2, 3]));
        assert_eq!(strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);

        let offsets: Vec<_> = broadcast_offsets(&[3], &[2, 3]).collect();
        assert_eq!(offsets, [0, 1, 2, 0, 1, 2]);

        let offsets: Vec<_> = broadcast_offsets(&[2, 1], &[2, 3]).collect();
        assert_eq!(offsets, [0, 0, 0, 1, 1, 1]);

        let offsets: Vec<_> = broadcast_offsets(&[], &[2]).collect();
        assert_eq!(offsets, [0, 0]);

        let x = Tensor::from_data(&[2, 1], vec![1, 2]);
        let y = x.broadcast_to(&[2, 2]).unwrap();
        assert_eq!(y.data(), &[1, 1, 2, 2]);
    }
}
