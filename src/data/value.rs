//! Scalar types and field values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a scalar or scalar-array field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    /// `bool`
    Boolean,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
}

impl ScalarType {
    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
        }
    }

    /// Initial value of a freshly created scalar field.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            Self::Boolean => Value::Boolean(false),
            Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Double => Value::Double(0.0),
            Self::String => Value::String(String::new()),
        }
    }

    /// Initial value of a freshly created array field.
    #[must_use]
    pub const fn default_array(self) -> Value {
        match self {
            Self::Boolean => Value::BooleanArray(Vec::new()),
            Self::Int => Value::IntArray(Vec::new()),
            Self::Long => Value::LongArray(Vec::new()),
            Self::Double => Value::DoubleArray(Vec::new()),
            Self::String => Value::StringArray(Vec::new()),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The value held by one field slot.
///
/// Structure slots hold `Null`; their content lives in the slots of their
/// sub-fields.
///
/// # Examples
///
/// ```
/// use pvdb::data::{ScalarType, Value};
///
/// let v = Value::Double(2.0);
/// assert_eq!(v.scalar_type(), Some(ScalarType::Double));
/// assert_eq!(v.as_double(), Some(2.0));
/// assert!(!v.is_array());
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    /// Element type, or `None` for `Null`.
    #[must_use]
    pub const fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) | Self::BooleanArray(_) => Some(ScalarType::Boolean),
            Self::Int(_) | Self::IntArray(_) => Some(ScalarType::Int),
            Self::Long(_) | Self::LongArray(_) => Some(ScalarType::Long),
            Self::Double(_) | Self::DoubleArray(_) => Some(ScalarType::Double),
            Self::String(_) | Self::StringArray(_) => Some(ScalarType::String),
        }
    }

    /// True for the array variants.
    pub const fn is_array(&self) -> bool {
        matches!(
            self,
            Self::BooleanArray(_)
                | Self::IntArray(_)
                | Self::LongArray(_)
                | Self::DoubleArray(_)
                | Self::StringArray(_)
        )
    }

    /// True for structure slots.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The bool, if this is a `Boolean`.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// The int, if this is an `Int`.
    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, widening `Int`.
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::Int(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Numeric value as a double, widening integers.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The string, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// The elements, if this is a `DoubleArray`.
    pub fn as_double_array(&self) -> Option<&[f64]> {
        match self {
            Self::DoubleArray(v) => Some(v),
            _ => None,
        }
    }

    /// Number of elements of an array value.
    #[must_use]
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Self::BooleanArray(v) => Some(v.len()),
            Self::IntArray(v) => Some(v.len()),
            Self::LongArray(v) => Some(v.len()),
            Self::DoubleArray(v) => Some(v.len()),
            Self::StringArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Up to `count` elements starting at `offset`, as an array of the same type.
    #[must_use]
    pub fn array_slice(&self, offset: usize, count: usize) -> Option<Self> {
        macro_rules! slice {
            ($variant:ident, $v:expr) => {
                Some(Self::$variant($v.iter().skip(offset).take(count).cloned().collect()))
            };
        }
        match self {
            Self::BooleanArray(v) => slice!(BooleanArray, v),
            Self::IntArray(v) => slice!(IntArray, v),
            Self::LongArray(v) => slice!(LongArray, v),
            Self::DoubleArray(v) => slice!(DoubleArray, v),
            Self::StringArray(v) => slice!(StringArray, v),
            _ => None,
        }
    }

    /// Truncate or pad (with default elements) an array value to `len`.
    ///
    /// Returns false for non-array values.
    pub fn resize_array(&mut self, len: usize) -> bool {
        match self {
            Self::BooleanArray(v) => v.resize(len, false),
            Self::IntArray(v) => v.resize(len, 0),
            Self::LongArray(v) => v.resize(len, 0),
            Self::DoubleArray(v) => v.resize(len, 0.0),
            Self::StringArray(v) => v.resize(len, String::new()),
            _ => return false,
        }
        true
    }

    /// Overwrite `count` elements starting at `offset` with the first `count`
    /// elements of `source`. The array ends up `offset + count` long.
    ///
    /// Returns false when `source` is an array of another type or holds fewer
    /// than `count` elements.
    pub fn splice_array(&mut self, offset: usize, source: &Self, count: usize) -> bool {
        let fits = self.is_array()
            && self.scalar_type() == source.scalar_type()
            && source.array_len().is_some_and(|len| len >= count);
        if !fits {
            return false;
        }
        self.resize_array(offset + count);
        match (self, source) {
            (Self::BooleanArray(d), Self::BooleanArray(s)) => d[offset..].clone_from_slice(&s[..count]),
            (Self::IntArray(d), Self::IntArray(s)) => d[offset..].clone_from_slice(&s[..count]),
            (Self::LongArray(d), Self::LongArray(s)) => d[offset..].clone_from_slice(&s[..count]),
            (Self::DoubleArray(d), Self::DoubleArray(s)) => d[offset..].clone_from_slice(&s[..count]),
            (Self::StringArray(d), Self::StringArray(s)) => d[offset..].clone_from_slice(&s[..count]),
            _ => return false,
        }
        true
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::BooleanArray(_) => "boolean[]",
            Self::IntArray(_) => "int[]",
            Self::LongArray(_) => "long[]",
            Self::DoubleArray(_) => "double[]",
            Self::StringArray(_) => "string[]",
        }
    }

    /// JSON rendering used by record dumps.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Boolean(v) => Json::from(*v),
            Self::Int(v) => Json::from(*v),
            Self::Long(v) => Json::from(*v),
            Self::Double(v) => Json::from(*v),
            Self::String(v) => Json::from(v.as_str()),
            Self::BooleanArray(v) => Json::from(v.clone()),
            Self::IntArray(v) => Json::from(v.clone()),
            Self::LongArray(v) => Json::from(v.clone()),
            Self::DoubleArray(v) => Json::from(v.clone()),
            Self::StringArray(v) => Json::from(v.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::DoubleArray(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_defaults_match_type() {
        for st in [
            ScalarType::Boolean,
            ScalarType::Int,
            ScalarType::Long,
            ScalarType::Double,
            ScalarType::String,
        ] {
            assert_eq!(st.default_value().scalar_type(), Some(st));
            assert!(!st.default_value().is_array());
            assert!(st.default_array().is_array());
            assert_eq!(st.default_array().scalar_type(), Some(st));
        }
    }

    #[test]
    fn numeric_widening_accessors() {
        assert_eq!(Value::Int(3).as_long(), Some(3));
        assert_eq!(Value::Int(3).as_double(), Some(3.0));
        assert_eq!(Value::String("x".into()).as_double(), None);
    }

    #[test]
    fn json_rendering() {
        assert_eq!(Value::Double(1.5).to_json(), serde_json::json!(1.5));
        assert_eq!(
            Value::DoubleArray(vec![1.0, 2.0]).to_json(),
            serde_json::json!([1.0, 2.0])
        );
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn array_slice_resize_and_splice() {
        let mut v = Value::IntArray(vec![1, 2, 3, 4]);
        assert_eq!(v.array_len(), Some(4));
        assert_eq!(v.array_slice(1, 2), Some(Value::IntArray(vec![2, 3])));
        assert_eq!(v.array_slice(3, 10), Some(Value::IntArray(vec![4])));
        assert_eq!(Value::Int(1).array_slice(0, 1), None);

        assert!(v.splice_array(5, &Value::IntArray(vec![9, 8, 7]), 2));
        assert_eq!(v, Value::IntArray(vec![1, 2, 3, 4, 0, 9, 8]));
        assert!(v.splice_array(1, &Value::IntArray(vec![5]), 1));
        assert_eq!(v, Value::IntArray(vec![1, 5]));

        assert!(!v.splice_array(0, &Value::DoubleArray(vec![1.0]), 1));
        assert!(!v.splice_array(0, &Value::IntArray(vec![1]), 2));
        assert_eq!(v, Value::IntArray(vec![1, 5]));
    }

    #[test]
    fn serde_roundtrip_tagged() {
        let v = Value::Long(42);
        let s = serde_json::to_string(&v).unwrap();
        assert!(s.contains("\"type\":\"long\""));
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }
}
