use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::tensor::Tensor;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DataType {
    Int32,
    Float,
}

impl DataType {
    /// Parse a type name such as "f32" or "int32".
    pub fn from_name(name: &str) -> Option<DataType> {
        match name {
            "f32" | "float" | "float32" => Some(DataType::Float),
            "i32" | "int" | "int32" => Some(DataType::Int32),
            _ => None,
        }
    }
}

impl Display for DataType {
    /// Format this enum value in the style of the corresponding Rust type (eg.
    /// "i32" for `DataType::Int32`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DataType::Float => "f32",
                DataType::Int32 => "i32",
            }
        )
    }
}

/// Get the [`DataType`] that corresponds to a given type.
pub trait DataTypeOf {
    fn dtype_of() -> DataType;
}

impl DataTypeOf for f32 {
    fn dtype_of() -> DataType {
        DataType::Float
    }
}

impl DataTypeOf for i32 {
    fn dtype_of() -> DataType {
        DataType::Int32
    }
}

/// Metadata about a tensor, without its content.
///
/// This is used in errors and timing reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueMeta {
    pub dtype: DataType,
    pub shape: Vec<usize>,
}

impl Display for ValueMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Produces strings such as "f32 [1, 16, 256]"
        write!(f, "{} {:?}", self.dtype, self.shape)
    }
}

/// Errors when converting a [`Value`] to a tensor of a specific type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TryFromValueError {
    WrongType { actual: DataType, expected: DataType },
}

impl Display for TryFromValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongType { actual, expected } => {
                write!(f, "expected {} tensor but got {}", expected, actual)
            }
        }
    }
}

impl Error for TryFromValueError {}

/// A tensor with one of the supported element types.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    FloatTensor(Tensor<f32>),
    Int32Tensor(Tensor<i32>),
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match self {
            Value::FloatTensor(_) => DataType::Float,
            Value::Int32Tensor(_) => DataType::Int32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::FloatTensor(t) => t.shape(),
            Value::Int32Tensor(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        match self {
            Value::FloatTensor(t) => t.len(),
            Value::Int32Tensor(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_meta(&self) -> ValueMeta {
        ValueMeta {
            dtype: self.dtype(),
            shape: self.shape().to_vec(),
        }
    }

    /// Return true if the data buffer is not shared with another value.
    pub fn is_unique(&self) -> bool {
        match self {
            Value::FloatTensor(t) => t.is_unique(),
            Value::Int32Tensor(t) => t.is_unique(),
        }
    }

    /// Return true if two values share a data buffer.
    pub fn shares_data(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::FloatTensor(a), Value::FloatTensor(b)) => a.shares_data(b),
            (Value::Int32Tensor(a), Value::Int32Tensor(b)) => a.shares_data(b),
            _ => false,
        }
    }

    /// Return the single element of a one-element tensor as a float.
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::FloatTensor(t) => t.item().copied(),
            Value::Int32Tensor(t) => t.item().map(|&x| x as f32),
        }
    }

    /// Return a value with the same data and a different shape.
    pub fn reshaped(&self, shape: &[usize]) -> Option<Value> {
        match self {
            Value::FloatTensor(t) => t.reshaped(shape).map(Value::FloatTensor),
            Value::Int32Tensor(t) => t.reshaped(shape).map(Value::Int32Tensor),
        }
    }
}

macro_rules! impl_value_conversions {
    ($variant:ident, $element_type:ty) => {
        impl From<Tensor<$element_type>> for Value {
            fn from(t: Tensor<$element_type>) -> Value {
                Value::$variant(t)
            }
        }

        impl From<$element_type> for Value {
            fn from(x: $element_type) -> Value {
                Value::$variant(Tensor::from_scalar(x))
            }
        }

        impl TryFrom<Value> for Tensor<$element_type> {
            type Error = TryFromValueError;

            fn try_from(o: Value) -> Result<Tensor<$element_type>, Self::Error> {
                let actual = o.dtype();
                match o {
                    Value::$variant(t) => Ok(t),
                    _ => Err(TryFromValueError::WrongType {
                        actual,
                        expected: <$element_type as DataTypeOf>::dtype_of(),
                    }),
                }
            }
        }

        impl<'a> TryFrom<&'a Value> for &'a Tensor<$element_type> {
            type Error = TryFromValueError;

            fn try_from(o: &'a Value) -> Result<&'a Tensor<$element_type>, Self::Error> {
                match o {
                    Value::$variant(t) => Ok(t),
                    _ => Err(TryFromValueError::WrongType {
                        actual: o.dtype(),
                        expected: <$element_type as DataTypeOf>::dtype_of(),
                    }),
                }
            }
        }
    };
}

impl_value_conversions!(FloatTensor, f32);
impl_value_conversions!(Int32Tensor, i32);
