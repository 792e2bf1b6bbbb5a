//! Host-side values exchanged with the peer

use std::fmt;

use crate::error::{BridgeError, Result};
use crate::handles::{HostRef, RemoteObject};

/// A value that crossed (or will cross) the process boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    /// Peer integers outside this range arrive as [`Value::Remote`].
    Int(i128),
    Float(f64),
    /// Exact ratio. Sent to the peer as a float; never produced by decoding.
    Rational { numer: i128, denom: i128 },
    /// Both parts travel as floats, so integer parts come back inexact.
    Complex { re: f64, im: f64 },
    Str(String),
    List(Vec<Value>),
    /// Fixed-size sequence (Python tuple).
    Tuple(Vec<Value>),
    /// Mapping in the peer's iteration order.
    Dict(Vec<(Value, Value)>),
    Array(NdArray),
    /// Object that stays in the peer.
    Remote(RemoteObject),
    /// Object that stays in the host.
    Host(HostRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Rational { .. } => "rational",
            Value::Complex { .. } => "complex",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Array(_) => "ndarray",
            Value::Remote(_) => "remote",
            Value::Host(_) => "host",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Numeric value as a float; rationals are divided out.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Rational { numer, denom } => Some(*numer as f64 / *denom as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            Value::Remote(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostRef> {
        match self {
            Value::Host(object) => Some(object),
            _ => None,
        }
    }

    /// Look up a dictionary entry by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i128)
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, i128, u8, u16, u32, u64, usize, isize);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<RemoteObject> for Value {
    fn from(v: RemoteObject) -> Self {
        Value::Remote(v)
    }
}

impl From<HostRef> for Value {
    fn from(v: HostRef) -> Self {
        Value::Host(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Rational { numer, denom } => write!(f, "{}/{}", numer, denom),
            Value::Complex { re, im } => write!(f, "complex({:?}, {:?})", re, im),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::List(items) => {
                write!(f, "[")?;
                write_joined(f, items)?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                write_joined(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Array(array) => write!(f, "ndarray(shape={:?})", array.shape()),
            Value::Remote(handle) => write!(f, "<{} #{}>", handle.type_name(), handle.id()),
            Value::Host(object) => write!(f, "<host {}>", object.type_name()),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Dense n-dimensional array stored in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<Value>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<Value>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(BridgeError::Encode(format!(
                "array of shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn from_f64(shape: Vec<usize>, data: impl IntoIterator<Item = f64>) -> Result<Self> {
        Self::new(shape, data.into_iter().map(Value::Float).collect())
    }

    pub fn from_i64(shape: Vec<usize>, data: impl IntoIterator<Item = i64>) -> Result<Self> {
        Self::new(shape, data.into_iter().map(Value::from).collect())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[Value] {
        &self.data
    }

    pub fn into_data(self) -> Vec<Value> {
        self.data
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<&Value> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (i, (&idx, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            let stride: usize = self.shape[i + 1..].iter().product();
            offset += idx * stride;
        }
        self.data.get(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_names() {
        assert_eq!(Value::from(42).type_name(), "int");
        assert_eq!(Value::from(true).type_name(), "bool");
        assert_eq!(Value::from("hello").type_name(), "str");
        assert_eq!(Value::from(None::<i32>).type_name(), "None");
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", Value::from(42)), "42");
        assert_eq!(format!("{}", Value::from(1.5)), "1.5");
        assert_eq!(
            format!("{}", Value::Tuple(vec![Value::from(1)])),
            "(1,)"
        );
        assert_eq!(
            format!("{}", Value::Complex { re: 1.0, im: -2.0 }),
            "complex(1.0, -2.0)"
        );
    }

    #[test]
    fn test_array_shape_checked() {
        assert!(NdArray::from_i64(vec![2, 3], 0..6).is_ok());
        assert!(NdArray::from_i64(vec![2, 3], 0..5).is_err());
        let empty = NdArray::from_f64(vec![4, 0], Vec::new()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.ndim(), 2);
    }

    #[test]
    fn test_array_get() {
        let array = NdArray::from_i64(vec![2, 3], 0..6).unwrap();
        assert_eq!(array.get(&[1, 2]), Some(&Value::Int(5)));
        assert_eq!(array.get(&[0, 1]), Some(&Value::Int(1)));
        assert_eq!(array.get(&[2, 0]), None);
    }

    #[test]
    fn test_dict_get() {
        let dict = Value::Dict(vec![(Value::from("a"), Value::from(1))]);
        assert_eq!(dict.get("a"), Some(&Value::Int(1)));
        assert_eq!(dict.get("b"), None);
    }
}
