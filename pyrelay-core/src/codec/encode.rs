//! Host value → Python expression text

use std::fmt::Write as _;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handles::{HandleTable, HostStash, RemoteObject};

use super::array::{split_first_axis, write_exchange_file};
use super::value::{NdArray, Value};

/// Encodes values as Python source that evaluates to an equivalent object
/// inside the peer. The output never contains a raw newline.
pub struct Encoder<'a> {
    config: &'a BridgeConfig,
    handles: &'a HandleTable,
    stash: &'a mut HostStash,
}

impl<'a> Encoder<'a> {
    pub fn new(config: &'a BridgeConfig, handles: &'a HandleTable, stash: &'a mut HostStash) -> Self {
        Self {
            config,
            handles,
            stash,
        }
    }

    pub fn encode(&mut self, value: &Value) -> Result<String> {
        let mut out = String::new();
        self.write_value(value, &mut out)?;
        Ok(out)
    }

    /// Peer id of `handle`, refusing handles from an earlier process.
    pub fn handle_id(&self, handle: &RemoteObject) -> Result<u64> {
        self.handles.check(handle)
    }

    /// Positional arguments as a Python tuple literal.
    pub fn encode_args(&mut self, args: &[Value]) -> Result<String> {
        let mut out = String::new();
        self.write_seq('(', ')', args, &mut out)?;
        Ok(out)
    }

    /// Keyword arguments as a Python dict literal with string keys.
    pub fn encode_kwargs<K: AsRef<str>>(&mut self, kwargs: &[(K, Value)]) -> Result<String> {
        let mut out = String::from("{");
        for (i, (key, value)) in kwargs.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&py_str(key.as_ref()));
            out.push_str(": ");
            self.write_value(value, &mut out)?;
        }
        out.push('}');
        Ok(out)
    }

    fn write_value(&mut self, value: &Value, out: &mut String) -> Result<()> {
        match value {
            Value::None => out.push_str("None"),
            Value::Bool(v) => out.push_str(if *v { "True" } else { "False" }),
            Value::Int(v) => {
                let _ = write!(out, "{}", v);
            }
            Value::Float(v) => out.push_str(&py_float(*v)),
            Value::Rational { numer, denom } => {
                if *denom == 0 {
                    return Err(BridgeError::Encode(format!(
                        "rational {}/0 has a zero denominator",
                        numer
                    )));
                }
                // Python true division; the exact ratio is lost here.
                let _ = write!(out, "({} / {})", numer, denom);
            }
            Value::Complex { re, im } => {
                let _ = write!(out, "complex({}, {})", py_float(*re), py_float(*im));
            }
            Value::Str(s) => out.push_str(&py_str(s)),
            Value::List(items) => self.write_seq('[', ']', items, out)?,
            Value::Tuple(items) => self.write_seq('(', ')', items, out)?,
            Value::Dict(entries) => {
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(k, out)?;
                    out.push_str(": ");
                    self.write_value(v, out)?;
                }
                out.push('}');
            }
            Value::Array(array) => self.write_array(array, out)?,
            Value::Remote(handle) => {
                let id = self.handles.check(handle)?;
                let _ = write!(out, "_pyrelay_handle({})", id);
            }
            Value::Host(object) => {
                let id = self.stash.stash(object);
                let _ = write!(out, "_pyrelay_host({}, {})", id, py_str(object.type_name()));
            }
        }
        Ok(())
    }

    fn write_seq(&mut self, open: char, close: char, items: &[Value], out: &mut String) -> Result<()> {
        out.push(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.write_value(item, out)?;
        }
        if open == '(' && items.len() == 1 {
            out.push(',');
        }
        out.push(close);
        Ok(())
    }

    fn write_array(&mut self, array: &NdArray, out: &mut String) -> Result<()> {
        let mut inline = String::from("_pyrelay_array(");
        let shape: Vec<Value> = array.shape().iter().map(|&d| Value::from(d)).collect();
        self.write_seq('(', ')', &shape, &mut inline)?;
        inline.push_str(", ");
        self.write_nested(array.data(), array.shape(), &mut inline)?;
        inline.push(')');

        match self.config.array_file_target(array.len()) {
            Some(dir) => {
                let path = write_exchange_file(dir, &inline)?;
                let _ = write!(
                    out,
                    "_pyrelay_load_array({})",
                    py_str(&path.to_string_lossy())
                );
            }
            None => out.push_str(&inline),
        }
        Ok(())
    }

    fn write_nested(&mut self, data: &[Value], shape: &[usize], out: &mut String) -> Result<()> {
        if shape.is_empty() {
            return match data.first() {
                Some(scalar) => self.write_value(scalar, out),
                None => Err(BridgeError::Encode("zero-dimensional array without data".into())),
            };
        }
        out.push('[');
        for (i, row) in split_first_axis(data, shape).into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.write_nested(row, &shape[1..], out)?;
        }
        out.push(']');
        Ok(())
    }
}

/// Python string literal for `s`. Control characters are escaped so the
/// literal always fits on one line.
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            '\u{2028}' | '\u{2029}' | '\u{85}' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Python float literal; `repr`-compatible for finite values.
pub fn py_float(v: f64) -> String {
    if v.is_nan() {
        "float(\"nan\")".to_string()
    } else if v.is_infinite() {
        if v > 0.0 {
            "float(\"inf\")".to_string()
        } else {
            "float(\"-inf\")".to_string()
        }
    } else {
        format!("{:?}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{HostObject, HostRef};

    struct Opaque;

    impl HostObject for Opaque {
        fn type_name(&self) -> &str {
            "Opaque"
        }
    }

    fn encode_with(config: &BridgeConfig, value: &Value) -> Result<String> {
        let handles = HandleTable::new();
        let mut stash = HostStash::default();
        Encoder::new(config, &handles, &mut stash).encode(value)
    }

    fn encode(value: &Value) -> String {
        encode_with(&BridgeConfig::default(), value).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(encode(&Value::None), "None");
        assert_eq!(encode(&Value::Bool(true)), "True");
        assert_eq!(encode(&Value::Int(-42)), "-42");
        assert_eq!(encode(&Value::Float(0.1)), "0.1");
        assert_eq!(encode(&Value::Float(2.0)), "2.0");
        assert_eq!(encode(&Value::Float(f64::NEG_INFINITY)), "float(\"-inf\")");
        assert_eq!(
            encode(&Value::Complex { re: 1.0, im: -0.5 }),
            "complex(1.0, -0.5)"
        );
        assert_eq!(
            encode(&Value::Rational { numer: 1, denom: 3 }),
            "(1 / 3)"
        );
    }

    #[test]
    fn test_zero_denominator_rejected() {
        let err = encode_with(
            &BridgeConfig::default(),
            &Value::Rational { numer: 1, denom: 0 },
        );
        assert!(matches!(err, Err(BridgeError::Encode(_))));
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(py_str("plain"), "\"plain\"");
        assert_eq!(py_str("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(py_str("a\nb\\c"), "\"a\\nb\\\\c\"");
        assert_eq!(py_str("bell\u{7}"), "\"bell\\x07\"");
        assert!(!py_str("line\nbreak\r\u{2028}").contains('\n'));
    }

    #[test]
    fn test_sequences() {
        assert_eq!(encode(&Value::Tuple(vec![])), "()");
        assert_eq!(encode(&Value::Tuple(vec![Value::Int(1)])), "(1,)");
        assert_eq!(
            encode(&Value::List(vec![Value::Int(1), Value::from("x")])),
            "[1, \"x\"]"
        );
        assert_eq!(
            encode(&Value::Dict(vec![(Value::from("k"), Value::Int(2))])),
            "{\"k\": 2}"
        );
    }

    #[test]
    fn test_array_inline() {
        let array = NdArray::from_i64(vec![2, 3], 1..=6).unwrap();
        assert_eq!(
            encode(&Value::Array(array)),
            "_pyrelay_array((2, 3), [[1, 2, 3], [4, 5, 6]])"
        );

        let empty = NdArray::from_f64(vec![2, 0], Vec::new()).unwrap();
        assert_eq!(encode(&Value::Array(empty)), "_pyrelay_array((2, 0), [[], []])");

        let scalar = NdArray::from_i64(vec![], [7]).unwrap();
        assert_eq!(encode(&Value::Array(scalar)), "_pyrelay_array((), 7)");
    }

    #[test]
    fn test_array_file_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::default().with_array_files(dir.path(), 3);

        let small = NdArray::from_i64(vec![3], 0..3).unwrap();
        assert!(encode_with(&config, &Value::Array(small))
            .unwrap()
            .starts_with("_pyrelay_array("));

        let large = NdArray::from_i64(vec![4], 0..4).unwrap();
        let encoded = encode_with(&config, &Value::Array(large)).unwrap();
        assert!(encoded.starts_with("_pyrelay_load_array(\""));

        let written: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(written.len(), 1);
        let contents = std::fs::read_to_string(written[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(contents, "_pyrelay_array((4,), [0, 1, 2, 3])");
    }

    #[test]
    fn test_remote_and_host_references() {
        let config = BridgeConfig::default();
        let handles = HandleTable::new();
        let mut stash = HostStash::default();
        let handle = handles.intern(12, "builtins.object");
        let host = HostRef::new(Opaque);

        let mut encoder = Encoder::new(&config, &handles, &mut stash);
        assert_eq!(
            encoder.encode(&Value::Remote(handle.clone())).unwrap(),
            "_pyrelay_handle(12)"
        );
        let first = encoder.encode(&Value::Host(host.clone())).unwrap();
        let second = encoder.encode(&Value::Host(host)).unwrap();
        assert_eq!(first, "_pyrelay_host(1, \"Opaque\")");
        assert_eq!(first, second);
        assert_eq!(stash.len(), 1);

        handles.invalidate();
        let mut encoder = Encoder::new(&config, &handles, &mut stash);
        assert!(matches!(
            encoder.encode(&Value::Remote(handle)),
            Err(BridgeError::StaleHandle { id: 12 })
        ));
    }

    #[test]
    fn test_call_arguments() {
        let config = BridgeConfig::default();
        let handles = HandleTable::new();
        let mut stash = HostStash::default();
        let mut encoder = Encoder::new(&config, &handles, &mut stash);
        assert_eq!(encoder.encode_args(&[Value::Int(-42)]).unwrap(), "(-42,)");
        assert_eq!(
            encoder
                .encode_kwargs(&[("sep", Value::from(", "))])
                .unwrap(),
            "{\"sep\": \", \"}"
        );
        assert_eq!(encoder.encode_kwargs::<&str>(&[]).unwrap(), "{}");
    }
}
