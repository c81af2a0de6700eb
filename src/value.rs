//! Values carried by observations and auto-update inputs.
//!
//! The engine only checks values for finiteness; interpreting them is up to
//! the inference step.

use serde::{Deserialize, Serialize};

/// A single named input value.
///
/// ```
/// use beliefstream::Value;
///
/// let y = Value::from(3.5);
/// assert_eq!(y.as_float(), Some(3.5));
/// assert_eq!(Value::from(vec![1.0, 2.0]).as_vector(), Some(&[1.0, 2.0][..]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Integer; also readable as a float.
    Int(i64),
    /// Scalar measurement.
    Float(f64),
    /// Free-form text.
    String(String),
    /// Dense numeric vector.
    Vector(Vec<f64>),
    /// Nested data, e.g. a belief's full parameter set.
    Structured(serde_json::Value),
    /// No value.
    #[default]
    Null,
}

impl Value {
    /// Numeric read: floats as-is, integers widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer read; floats are not truncated.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        if let Self::Int(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    /// Borrow a vector payload.
    #[must_use]
    pub fn as_vector(&self) -> Option<&[f64]> {
        if let Self::Vector(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Borrow a structured payload.
    #[must_use]
    pub const fn as_structured(&self) -> Option<&serde_json::Value> {
        if let Self::Structured(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// False if any numeric component is NaN or infinite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            Self::Vector(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(via $conv:path)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant($($conv)?(v))
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int via i64::from,
    i64 => Int,
    f64 => Float,
    String => String,
    Vec<f64> => Vector,
    serde_json::Value => Structured,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}
