//! The request/reply engine
//!
//! A [`Session`] is what holding the process lock buys you: exclusive use of
//! one peer's protocol streams. Host callbacks receive the same session, so
//! anything they ask of the peer nests inside the exchange that is already
//! in flight instead of queueing behind it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::bridge::BridgeState;
use crate::codec::{py_str, Decoder, Encoder, Value};
use crate::error::{BridgeError, Result};
use crate::handles::RemoteObject;
use crate::process::PeerProcess;

use super::{CallArgs, Reply, Request};

/// A host function callable from peer code by name.
pub type Callback = dyn Fn(&mut Session<'_>, CallArgs) -> Result<Value> + Send + Sync;

/// Deepest allowed chain of peer → host callbacks.
pub const MAX_CALLBACK_DEPTH: usize = 200;

pub struct Session<'a> {
    state: &'a BridgeState,
    peer: &'a mut PeerProcess,
    depth: usize,
    remote_depth: usize,
}

impl<'a> Session<'a> {
    pub(crate) fn new(state: &'a BridgeState, peer: &'a mut PeerProcess) -> Self {
        Self {
            state,
            peer,
            depth: 0,
            remote_depth: 0,
        }
    }

    /// Evaluate a Python expression in the peer's global namespace.
    pub fn evaluate(&mut self, expr: &str) -> Result<Value> {
        let remote = self.remote_mode();
        self.request(&Request::Eval { expr, remote })
    }

    /// Execute Python statements in the peer's global namespace.
    pub fn execute(&mut self, code: &str) -> Result<()> {
        self.request(&Request::Exec { code }).map(drop)
    }

    /// Call `name` (any expression naming a callable, e.g. `"math.sqrt"`).
    pub fn call(&mut self, name: &str, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value> {
        let remote = self.remote_mode();
        self.request(&Request::Call {
            name,
            args,
            kwargs,
            remote,
        })
    }

    pub fn get_attribute(&mut self, target: &RemoteObject, name: &str) -> Result<Value> {
        let remote = self.remote_mode();
        self.request(&Request::AttrGet {
            target,
            name,
            remote,
        })
    }

    pub fn set_attribute(&mut self, target: &RemoteObject, name: &str, value: &Value) -> Result<()> {
        self.request(&Request::AttrSet {
            target,
            name,
            value,
        })
        .map(drop)
    }

    /// Expose `callback` to peer code as the global `name`. Registering a
    /// name again replaces the previous callback.
    pub fn register_callback<F>(&mut self, name: &str, callback: F) -> Result<()>
    where
        F: Fn(&mut Session<'_>, CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        if !is_identifier(name) {
            return Err(BridgeError::callback(format!(
                "{:?} is not a valid Python identifier",
                name
            )));
        }
        self.state
            .callbacks
            .write()
            .insert(name.to_string(), Arc::new(callback));
        self.execute(&format!("_pyrelay_register_callback({})", py_str(name)))
    }

    /// Run `f` with the peer's stdout redirected into a private buffer and
    /// return what was printed. The redirection is undone even if `f` fails
    /// or panics.
    pub fn capture_output<T, F>(&mut self, f: F) -> Result<(T, String)>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        self.request(&Request::CaptureBegin)?;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => {
                if !self.peer.is_broken() {
                    if let Err(e) = self.request(&Request::CaptureEnd) {
                        log::warn!("Could not end capture after panic: {}", e);
                    }
                }
                panic::resume_unwind(payload)
            }
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                return result.map(|v| (v, String::new()));
            }
        }
        let captured = self.request(&Request::CaptureEnd);
        let value = result?;
        match captured? {
            Value::Str(text) => Ok((value, text)),
            other => Err(BridgeError::framing(format!(
                "capture returned {} instead of text",
                other.type_name()
            ))),
        }
    }

    /// Run `f` with every result left in the peer as a [`RemoteObject`].
    pub fn with_remote_objects<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        self.remote_depth += 1;
        let result = f(self);
        self.remote_depth -= 1;
        result
    }

    /// Like [`Session::with_remote_objects`], then copy the result back if it
    /// is a handle created inside this scope. Handles that already existed
    /// when the scope was entered are returned as they are.
    pub fn with_remote_objects_value<F>(&mut self, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Session<'_>) -> Result<Value>,
    {
        let mark = self.state.handles.high_water();
        let generation = self.state.handles.generation();
        match self.with_remote_objects(f)? {
            Value::Remote(handle) if handle.id() > mark && handle.generation() == generation => {
                self.materialize(&handle)
            }
            other => Ok(other),
        }
    }

    /// Copy a peer object to the host as an ordinary value.
    pub fn materialize(&mut self, handle: &RemoteObject) -> Result<Value> {
        let id = self.state.handles.check(handle)?;
        let expr = format!("_pyrelay_handle({})", id);
        self.request(&Request::Eval {
            expr: &expr,
            remote: false,
        })
    }

    /// Send the current array-exchange settings to the peer.
    pub(crate) fn push_config(&mut self) -> Result<()> {
        let settings = serde_json::to_string(&self.state.config.read().peer_settings())
            .map_err(|e| BridgeError::Encode(e.to_string()))?;
        self.execute(&format!("_pyrelay_configure({})", py_str(&settings)))
    }

    pub fn pid(&self) -> u32 {
        self.peer.pid()
    }

    pub fn peer_version(&self) -> &str {
        self.peer.version()
    }

    /// Current callback nesting depth; 0 outside any callback.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_remote_mode(&self) -> bool {
        self.remote_mode()
    }

    fn remote_mode(&self) -> bool {
        self.remote_depth > 0
    }

    fn frame(&mut self, request: &Request<'_>) -> Result<String> {
        let config = self.state.config.read();
        let mut encoder = Encoder::new(&config, &self.state.handles, &mut self.peer.stash);
        request.to_frame(&mut encoder)
    }

    /// Tell the peer about handles the host no longer references.
    fn flush_deletes(&mut self) -> Result<()> {
        let pending = self.state.handles.take_pending();
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!("Releasing {} peer object(s)", pending.len());
        for id in pending {
            let frame = self.frame(&Request::Delete(id))?;
            self.peer.write_frame(&frame)?;
        }
        Ok(())
    }

    fn request(&mut self, request: &Request<'_>) -> Result<Value> {
        self.flush_deletes()?;
        let frame = self.frame(request)?;
        self.peer.write_frame(&frame)?;
        self.await_reply()
    }

    /// Read frames until the request in flight is answered, serving any
    /// callbacks and host-object requests the peer makes meanwhile.
    fn await_reply(&mut self) -> Result<Value> {
        // The last callback failure reported to the peer. If the peer lets it
        // escape, the caller gets the original error back.
        let mut deferred: Option<BridgeError> = None;

        loop {
            let line = self.peer.read_line()?;
            let parsed = {
                let decoder = Decoder::new(&self.state.handles, &self.peer.stash);
                Reply::parse(&line, &decoder)
            };
            let reply = match parsed {
                Ok(reply) => reply,
                Err(e) => {
                    self.peer.mark_broken(&e.to_string());
                    return Err(e);
                }
            };

            match reply {
                Reply::Return(value) => return Ok(value),
                Reply::Error {
                    type_name,
                    message,
                    traceback,
                } => {
                    if type_name == "HostCallbackError" {
                        if let Some(original) = deferred.take() {
                            return Err(original);
                        }
                    }
                    return Err(BridgeError::Evaluation {
                        type_name,
                        message,
                        traceback,
                    });
                }
                Reply::CallbackInvoke { name, args } => {
                    let outcome = self.invoke_callback(&name, args);
                    if let Some(failure) = self.answer(outcome)? {
                        deferred = Some(failure);
                    }
                }
                Reply::HostAttrGet { id, name } => {
                    let outcome = match self.peer.stash.get(id) {
                        Some(object) => object.object().get_attr(&name).ok_or_else(|| {
                            BridgeError::Evaluation {
                                type_name: "AttributeError".to_string(),
                                message: format!(
                                    "'{}' host object has no attribute '{}'",
                                    object.type_name(),
                                    name
                                ),
                                traceback: String::new(),
                            }
                        }),
                        None => Err(BridgeError::Evaluation {
                            type_name: "AttributeError".to_string(),
                            message: format!("host object {} is no longer available", id),
                            traceback: String::new(),
                        }),
                    };
                    self.answer(outcome)?;
                }
                Reply::HostDelete(id) => {
                    if self.peer.stash.remove(id).is_none() {
                        log::debug!("Peer released unknown host object {}", id);
                    }
                }
            }
        }
    }

    fn invoke_callback(&mut self, name: &str, args: CallArgs) -> Result<Value> {
        let callback = self
            .state
            .callbacks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownCallback {
                name: name.to_string(),
            })?;
        if self.depth >= MAX_CALLBACK_DEPTH {
            return Err(BridgeError::CallbackDepthExceeded {
                depth: MAX_CALLBACK_DEPTH,
            });
        }

        log::debug!("Callback {} (depth {})", name, self.depth + 1);
        self.depth += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| (*callback)(self, args)));
        self.depth -= 1;

        result.unwrap_or_else(|payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(BridgeError::callback(format!(
                "callback {} panicked: {}",
                name, detail
            )))
        })
    }

    /// Reply to a callback or host-attribute request. Returns the error that
    /// was forwarded to the peer, if any.
    fn answer(&mut self, outcome: Result<Value>) -> Result<Option<BridgeError>> {
        let encoded = outcome.and_then(|value| self.frame(&Request::CallbackReturn(&value)));
        match encoded {
            Ok(frame) => {
                self.peer.write_frame(&frame)?;
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let message = match &e {
                    BridgeError::Evaluation { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                let frame = self.frame(&Request::CallbackError {
                    type_name: e.peer_type_name(),
                    message: &message,
                })?;
                self.peer.write_frame(&frame)?;
                Ok(Some(e))
            }
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}
