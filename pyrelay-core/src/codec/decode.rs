//! Peer text → host value
//!
//! The peer writes a small subset of Python literal syntax plus a handful of
//! constructor forms (`complex`, `ndarray`, `ndarray_file`, `handle`,
//! `host_object`). Anything else is a framing error.

use std::path::Path;
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::handles::{HandleTable, HostStash};

use super::array::{flatten_nested, take_exchange_file};
use super::value::{NdArray, Value};

pub struct Decoder<'a> {
    handles: &'a Arc<HandleTable>,
    stash: &'a HostStash,
}

impl<'a> Decoder<'a> {
    pub fn new(handles: &'a Arc<HandleTable>, stash: &'a HostStash) -> Self {
        Self { handles, stash }
    }

    /// Decode one complete value; trailing text is an error.
    pub fn decode(&self, text: &str) -> Result<Value> {
        let mut parser = Parser {
            src: text,
            pos: 0,
            decoder: self,
        };
        let value = parser.parse_value()?;
        parser.skip_ws();
        if parser.pos != text.len() {
            return Err(parser.error("trailing characters after value"));
        }
        Ok(value)
    }

    fn construct(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match (name, args.as_slice()) {
            ("complex", [re, im]) => match (re.as_f64(), im.as_f64()) {
                (Some(re), Some(im)) => Ok(Value::Complex { re, im }),
                _ => Err(BridgeError::framing("complex() expects two numbers")),
            },
            ("handle", [Value::Int(id), Value::Str(type_name)]) => {
                let id = u64::try_from(*id)
                    .map_err(|_| BridgeError::framing(format!("invalid handle id {}", id)))?;
                Ok(Value::Remote(self.handles.intern(id, type_name)))
            }
            ("host_object", [Value::Int(id)]) => {
                let id = u64::try_from(*id).unwrap_or(u64::MAX);
                self.stash
                    .get(id)
                    .cloned()
                    .map(Value::Host)
                    .ok_or_else(|| BridgeError::framing(format!("unknown host object {}", id)))
            }
            ("ndarray", [shape, nested]) => {
                let shape = shape_of(shape)?;
                let mut data = Vec::with_capacity(shape.iter().product());
                flatten_nested(nested.clone(), &shape, &mut data)?;
                Ok(Value::Array(NdArray::new(shape, data).map_err(|e| {
                    BridgeError::framing(e.to_string())
                })?))
            }
            ("ndarray_file", [Value::Str(path)]) => {
                let contents = take_exchange_file(Path::new(path))?;
                match self.decode(&contents)? {
                    array @ Value::Array(_) => Ok(array),
                    other => Err(BridgeError::framing(format!(
                        "array exchange file {} held a {}",
                        path,
                        other.type_name()
                    ))),
                }
            }
            _ => Err(BridgeError::framing(format!(
                "unknown constructor {}() with {} argument(s)",
                name,
                args.len()
            ))),
        }
    }
}

fn shape_of(value: &Value) -> Result<Vec<usize>> {
    let dims = value
        .as_slice()
        .ok_or_else(|| BridgeError::framing("array shape must be a tuple"))?;
    dims.iter()
        .map(|d| {
            d.as_i128()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| BridgeError::framing(format!("invalid array dimension {}", d)))
        })
        .collect()
}

struct Parser<'p, 'a> {
    src: &'p str,
    pos: usize,
    decoder: &'p Decoder<'a>,
}

impl Parser<'_, '_> {
    fn error(&self, what: &str) -> BridgeError {
        let start = self.pos.min(self.src.len());
        let context: String = self.src[start..].chars().take(24).collect();
        BridgeError::framing(format!("{} at offset {} near {:?}", what, self.pos, context))
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            Some(b'[') => {
                self.pos += 1;
                let (items, _) = self.parse_items(b']')?;
                Ok(Value::List(items))
            }
            Some(b'(') => {
                self.pos += 1;
                let (mut items, trailing_comma) = self.parse_items(b')')?;
                if items.len() == 1 && !trailing_comma {
                    // Parenthesised expression, not a tuple.
                    return Ok(items.remove(0));
                }
                Ok(Value::Tuple(items))
            }
            Some(b'{') => {
                self.pos += 1;
                self.parse_dict()
            }
            Some(b'"') => self.parse_string().map(Value::Str),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.parse_word(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    /// Comma-separated values up to `close`. Reports whether a trailing comma was seen.
    fn parse_items(&mut self, close: u8) -> Result<(Vec<Value>, bool)> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok((items, trailing_comma));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    trailing_comma = true;
                }
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok((items, false));
                }
                _ => return Err(self.error(&format!("expected ',' or '{}'", close as char))),
            }
        }
    }

    fn parse_dict(&mut self) -> Result<Value> {
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Dict(entries));
            }
            let key = self.parse_value()?;
            self.expect(b':')?;
            let value = self.parse_value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    /// JSON-style double-quoted string.
    fn parse_string(&mut self) -> Result<String> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek() {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
        let literal = self
            .src
            .get(start..self.pos)
            .ok_or_else(|| self.error("unterminated string"))?;
        serde_json::from_str(literal)
            .map_err(|e| BridgeError::framing(format!("bad string literal {}: {}", literal, e)))
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
            let rest = &self.src[self.pos..];
            if rest.starts_with("inf") {
                self.pos += 3;
                return Ok(Value::Float(f64::NEG_INFINITY));
            }
        }
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
        ) {
            self.pos += 1;
        }
        let token = &self.src[start..self.pos];
        if token.contains(['.', 'e', 'E']) {
            token
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| BridgeError::framing(format!("bad float {:?}: {}", token, e)))
        } else {
            token
                .parse::<i128>()
                .map(Value::Int)
                .map_err(|e| BridgeError::framing(format!("bad integer {:?}: {}", token, e)))
        }
    }

    fn parse_word(&mut self) -> Result<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];
        match word {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "inf" => Ok(Value::Float(f64::INFINITY)),
            "nan" => Ok(Value::Float(f64::NAN)),
            name => {
                self.expect(b'(')?;
                let (args, _) = self.parse_items(b')')?;
                self.decoder.construct(name, args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Result<Value> {
        let handles = HandleTable::new();
        let stash = HostStash::default();
        Decoder::new(&handles, &stash).decode(text)
    }

    #[test]
    fn test_atoms() {
        assert_eq!(decode("7").unwrap(), Value::Int(7));
        assert_eq!(decode("-42").unwrap(), Value::Int(-42));
        assert_eq!(decode("1.5").unwrap(), Value::Float(1.5));
        assert_eq!(decode("1e+100").unwrap(), Value::Float(1e100));
        assert_eq!(decode("-inf").unwrap(), Value::Float(f64::NEG_INFINITY));
        assert!(matches!(decode("nan").unwrap(), Value::Float(v) if v.is_nan()));
        assert_eq!(decode("None").unwrap(), Value::None);
        assert_eq!(decode("True").unwrap(), Value::Bool(true));
        assert_eq!(
            decode("complex(1.0, -2.5)").unwrap(),
            Value::Complex { re: 1.0, im: -2.5 }
        );
    }

    #[test]
    fn test_large_integers() {
        assert_eq!(
            decode("170141183460469231731687303715884105727").unwrap(),
            Value::Int(i128::MAX)
        );
        assert!(decode("170141183460469231731687303715884105728").is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(decode(r#""a\nb""#).unwrap(), Value::from("a\nb"));
        assert_eq!(decode(r#""say \"hi\"""#).unwrap(), Value::from("say \"hi\""));
        assert_eq!(decode(r#""é😀""#).unwrap(), Value::from("é😀"));
        assert!(decode(r#""open"#).is_err());
    }

    #[test]
    fn test_sequences() {
        assert_eq!(
            decode("[0, 1, 4, 9]").unwrap(),
            Value::List(vec![0.into(), 1.into(), 4.into(), 9.into()])
        );
        assert_eq!(decode("()").unwrap(), Value::Tuple(vec![]));
        assert_eq!(decode("(1,)").unwrap(), Value::Tuple(vec![1.into()]));
        assert_eq!(decode("(1)").unwrap(), Value::Int(1));
        assert_eq!(
            decode("(1, \"a\", [])").unwrap(),
            Value::Tuple(vec![1.into(), "a".into(), Value::List(vec![])])
        );
    }

    #[test]
    fn test_dict_decodes_keys_and_values() {
        let value = decode(r#"{"a": [1, 2], (1, 2): {"b": None}}"#).unwrap();
        let Value::Dict(entries) = value else {
            panic!("expected dict");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, Value::from("a"));
        assert_eq!(entries[0].1, Value::List(vec![1.into(), 2.into()]));
        assert_eq!(entries[1].0, Value::Tuple(vec![1.into(), 2.into()]));
        assert_eq!(
            entries[1].1,
            Value::Dict(vec![(Value::from("b"), Value::None)])
        );
    }

    #[test]
    fn test_ndarray() {
        let value = decode("ndarray((2, 3), [[1, 2, 3], [4, 5, 6]])").unwrap();
        let Value::Array(array) = value else {
            panic!("expected array");
        };
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array.get(&[1, 0]), Some(&Value::Int(4)));

        let value = decode("ndarray((3, 0), [[], [], []])").unwrap();
        let Value::Array(array) = value else {
            panic!("expected array");
        };
        assert_eq!(array.shape(), &[3, 0]);
        assert!(array.is_empty());

        assert!(decode("ndarray((2, 2), [[1, 2], [3]])").is_err());
    }

    #[test]
    fn test_ndarray_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.txt");
        std::fs::write(&path, "ndarray((2,), [1.5, 2.5])").unwrap();
        let text = format!("ndarray_file({})", serde_json::to_string(&path).unwrap());

        let value = decode(&text).unwrap();
        assert_eq!(
            value,
            Value::Array(NdArray::from_f64(vec![2], [1.5, 2.5]).unwrap())
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_handles_are_interned() {
        let handles = HandleTable::new();
        let stash = HostStash::default();
        let decoder = Decoder::new(&handles, &stash);

        let a = decoder.decode(r#"handle(3, "socket.socket")"#).unwrap();
        let b = decoder.decode(r#"[handle(3, "socket.socket")]"#).unwrap();
        let a = a.as_remote().unwrap();
        assert_eq!(a.type_name(), "socket.socket");
        assert_eq!(b.as_slice().unwrap()[0].as_remote(), Some(a));
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            decode("[1, 2"),
            Err(BridgeError::ProtocolFraming(_))
        ));
        assert!(decode("1 2").is_err());
        assert!(decode("mystery(1)").is_err());
        assert!(decode("host_object(9)").is_err());
        assert!(decode("").is_err());
    }
}
