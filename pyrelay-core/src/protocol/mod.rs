//! Wire protocol between the host and the peer runtime
//!
//! Every frame is a single tag byte, a newline-free payload and `\n`.
//! There are no sequence numbers: each request is answered before the next
//! one is written, and callbacks nest strictly inside the request that
//! triggered them.

mod session;

use crate::codec::{py_str, Decoder, Encoder, Value};
use crate::error::{BridgeError, Result};
use crate::handles::RemoteObject;

pub use session::{Callback, Session, MAX_CALLBACK_DEPTH};

/// Frames written by the host.
#[derive(Debug)]
pub enum Request<'a> {
    Eval {
        expr: &'a str,
        remote: bool,
    },
    Exec {
        code: &'a str,
    },
    Call {
        name: &'a str,
        args: &'a [Value],
        kwargs: &'a [(String, Value)],
        remote: bool,
    },
    AttrGet {
        target: &'a RemoteObject,
        name: &'a str,
        remote: bool,
    },
    AttrSet {
        target: &'a RemoteObject,
        name: &'a str,
        value: &'a Value,
    },
    /// Release a peer object. The peer does not answer.
    Delete(u64),
    CaptureBegin,
    CaptureEnd,
    /// Result of a host callback.
    CallbackReturn(&'a Value),
    /// Failure of a host callback, raised inside the peer.
    CallbackError {
        type_name: &'a str,
        message: &'a str,
    },
    Quit,
}

impl Request<'_> {
    pub fn tag(&self) -> char {
        match self {
            Request::Eval { .. } => 'e',
            Request::Exec { .. } => 'x',
            Request::Call { .. } => 'f',
            Request::AttrGet { .. } => 'g',
            Request::AttrSet { .. } => 's',
            Request::Delete(_) => 'd',
            Request::CaptureBegin => 'o',
            Request::CaptureEnd => 'O',
            Request::CallbackReturn(_) => 'r',
            Request::CallbackError { .. } => 'E',
            Request::Quit => 'q',
        }
    }

    /// Whether the peer answers this frame.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Delete(_) | Request::Quit)
    }

    /// Encode as a complete frame, trailing newline included.
    pub fn to_frame(&self, encoder: &mut Encoder<'_>) -> Result<String> {
        let payload = match self {
            Request::Eval { expr, remote } => format!("({}, {})", py_str(expr), py_bool(*remote)),
            Request::Exec { code } => format!("({},)", py_str(code)),
            Request::Call {
                name,
                args,
                kwargs,
                remote,
            } => format!(
                "({}, {}, {}, {})",
                py_str(name),
                encoder.encode_args(args)?,
                encoder.encode_kwargs(kwargs)?,
                py_bool(*remote)
            ),
            Request::AttrGet {
                target,
                name,
                remote,
            } => format!(
                "({}, {}, {})",
                encoder.handle_id(target)?,
                py_str(name),
                py_bool(*remote)
            ),
            Request::AttrSet {
                target,
                name,
                value,
            } => format!(
                "({}, {}, {})",
                encoder.handle_id(target)?,
                py_str(name),
                encoder.encode(value)?
            ),
            Request::Delete(id) => id.to_string(),
            Request::CaptureBegin | Request::CaptureEnd | Request::Quit => String::new(),
            Request::CallbackReturn(value) => encoder.encode(value)?,
            Request::CallbackError { type_name, message } => {
                format!("({}, {})", py_str(type_name), py_str(message))
            }
        };
        Ok(format!("{}{}\n", self.tag(), payload))
    }
}

fn py_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

/// Arguments the peer passed to a host callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyword: Vec::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Positional argument `index`, or a callback error naming what is missing.
    pub fn require(&self, index: usize) -> Result<&Value> {
        self.arg(index).ok_or_else(|| {
            BridgeError::callback(format!(
                "missing positional argument {} (got {})",
                index,
                self.positional.len()
            ))
        })
    }
}

/// Frames read from the peer.
#[derive(Debug)]
pub enum Reply {
    Return(Value),
    Error {
        type_name: String,
        message: String,
        traceback: String,
    },
    CallbackInvoke {
        name: String,
        args: CallArgs,
    },
    /// Peer code read an attribute of a host-object proxy.
    HostAttrGet {
        id: u64,
        name: String,
    },
    /// The peer dropped its proxy for a host object. Not answered.
    HostDelete(u64),
}

impl Reply {
    /// Parse one line (without its newline).
    pub fn parse(line: &str, decoder: &Decoder<'_>) -> Result<Self> {
        let mut chars = line.chars();
        let tag = chars
            .next()
            .ok_or_else(|| BridgeError::framing("empty frame"))?;
        let payload = chars.as_str();

        match tag {
            'r' => decoder.decode(payload).map(Reply::Return),
            'e' => match decoder.decode(payload)? {
                Value::Tuple(items) => match <[Value; 3]>::try_from(items) {
                    Ok([Value::Str(type_name), Value::Str(message), Value::Str(traceback)]) => {
                        Ok(Reply::Error {
                            type_name,
                            message,
                            traceback,
                        })
                    }
                    _ => Err(malformed(tag, payload)),
                },
                _ => Err(malformed(tag, payload)),
            },
            'c' => match decoder.decode(payload)? {
                Value::Tuple(items) => match <[Value; 3]>::try_from(items) {
                    Ok([Value::Str(name), Value::Tuple(positional), Value::Dict(entries)]) => {
                        let keyword = entries
                            .into_iter()
                            .map(|(key, value)| match key {
                                Value::Str(key) => Ok((key, value)),
                                _ => Err(malformed(tag, payload)),
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Reply::CallbackInvoke {
                            name,
                            args: CallArgs {
                                positional,
                                keyword,
                            },
                        })
                    }
                    _ => Err(malformed(tag, payload)),
                },
                _ => Err(malformed(tag, payload)),
            },
            'a' => match decoder.decode(payload)? {
                Value::Tuple(items) => match <[Value; 2]>::try_from(items) {
                    Ok([Value::Int(id), Value::Str(name)]) => Ok(Reply::HostAttrGet {
                        id: parse_id(id, tag, payload)?,
                        name,
                    }),
                    _ => Err(malformed(tag, payload)),
                },
                _ => Err(malformed(tag, payload)),
            },
            'd' => payload
                .trim()
                .parse()
                .map(Reply::HostDelete)
                .map_err(|_| malformed(tag, payload)),
            _ => Err(BridgeError::framing(format!(
                "unknown frame tag {:?} in {:?}",
                tag,
                truncate(line)
            ))),
        }
    }
}

fn parse_id(id: i128, tag: char, payload: &str) -> Result<u64> {
    u64::try_from(id).map_err(|_| malformed(tag, payload))
}

fn malformed(tag: char, payload: &str) -> BridgeError {
    BridgeError::framing(format!(
        "malformed '{}' frame: {:?}",
        tag,
        truncate(payload)
    ))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
