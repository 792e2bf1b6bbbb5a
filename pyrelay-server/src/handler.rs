//! Request handler for pyrelay-server

use pyrelay_core::{Bridge, BridgeError, Value};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

use crate::convert::{from_json, to_json, HandleMap};
use crate::rpc::{Request, Response};

pub struct Handler {
    bridge: Bridge,
    handles: HandleMap,
    shutdown: bool,
}

impl Handler {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            handles: HandleMap::new(),
            shutdown: false,
        }
    }

    /// Whether a `shutdown` request has been handled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn handle(&mut self, request: &Request) -> Response {
        match request {
            Request::Start => match self.bridge.start() {
                Ok(()) => {
                    info!("Peer running as pid {:?}", self.bridge.pid());
                    Response::success()
                }
                Err(e) => bridge_error(e),
            },
            Request::Stop => {
                self.stop();
                Response::success()
            }
            Request::Alive => Response::Alive {
                alive: self.bridge.is_alive(),
                pid: self.bridge.pid(),
                version: self.bridge.peer_version(),
            },
            Request::Eval { expr, remote } => {
                debug!("eval: {}", expr);
                let result = if *remote {
                    self.bridge.with_remote_objects(|s| s.evaluate(expr))
                } else {
                    self.bridge.evaluate(expr)
                };
                self.reply(result)
            }
            Request::Exec { code } => match self.bridge.execute(code) {
                Ok(()) => Response::success(),
                Err(e) => bridge_error(e),
            },
            Request::Call {
                name,
                args,
                kwargs,
                remote,
            } => self.handle_call(name, args, kwargs, *remote),
            Request::GetAttr {
                handle,
                name,
                remote,
            } => {
                let Some(target) = self.handles.get(handle).cloned() else {
                    return unknown_handle(*handle);
                };
                let result = if *remote {
                    self.bridge
                        .with_remote_objects(|s| s.get_attribute(&target, name))
                } else {
                    self.bridge.get_attribute(&target, name)
                };
                self.reply(result)
            }
            Request::SetAttr {
                handle,
                name,
                value,
            } => {
                let Some(target) = self.handles.get(handle).cloned() else {
                    return unknown_handle(*handle);
                };
                let value = match from_json(value, &self.handles) {
                    Ok(value) => value,
                    Err(e) => return Response::error(format!("Invalid value: {:#}", e)),
                };
                match self.bridge.set_attribute(&target, name, &value) {
                    Ok(()) => Response::success(),
                    Err(e) => bridge_error(e),
                }
            }
            Request::Release { handle } => match self.handles.remove(handle) {
                Some(_) => Response::success(),
                None => unknown_handle(*handle),
            },
            Request::Capture { code } => {
                match self.bridge.capture_output(|s| s.execute(code)) {
                    Ok(((), output)) => Response::Captured { output },
                    Err(e) => bridge_error(e),
                }
            }
            Request::Shutdown => {
                info!("Shutdown requested");
                self.stop();
                self.shutdown = true;
                Response::success()
            }
        }
    }

    fn handle_call(
        &mut self,
        name: &str,
        args: &[Json],
        kwargs: &Map<String, Json>,
        remote: bool,
    ) -> Response {
        let converted = args
            .iter()
            .map(|arg| from_json(arg, &self.handles))
            .collect::<anyhow::Result<Vec<_>>>()
            .and_then(|args| {
                let kwargs = kwargs
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), from_json(v, &self.handles)?)))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok((args, kwargs))
            });
        let (args, kwargs) = match converted {
            Ok(converted) => converted,
            Err(e) => return Response::error(format!("Invalid argument: {:#}", e)),
        };

        let result = if remote {
            self.bridge
                .with_remote_objects(|s| s.call(name, &args, &kwargs))
        } else {
            self.bridge.call(name, &args, &kwargs)
        };
        self.reply(result)
    }

    fn reply(&mut self, result: pyrelay_core::Result<Value>) -> Response {
        match result {
            Ok(value) => Response::value(to_json(value, &mut self.handles)),
            Err(e) => bridge_error(e),
        }
    }

    fn stop(&mut self) {
        if !self.handles.is_empty() {
            warn!("Stopping with {} unreleased handle(s)", self.handles.len());
        }
        self.handles.clear();
        self.bridge.stop();
    }
}

fn unknown_handle(id: u64) -> Response {
    Response::Error {
        error: format!("Unknown or released handle {}", id),
        kind: Some("StaleHandle".to_string()),
    }
}

fn bridge_error(e: BridgeError) -> Response {
    let kind = match &e {
        BridgeError::Evaluation { type_name, .. } => type_name.as_str(),
        BridgeError::StaleHandle { .. } => "StaleHandle",
        BridgeError::UnknownCallback { .. } => "UnknownCallback",
        BridgeError::CallbackDepthExceeded { .. } => "CallbackDepthExceeded",
        BridgeError::ProcessNotAlive(_) => "ProcessNotAlive",
        BridgeError::ProtocolFraming(_) => "ProtocolFraming",
        BridgeError::Spawn { .. } => "Spawn",
        BridgeError::Callback(_) => "Callback",
        BridgeError::Reentrant => "Reentrant",
        BridgeError::Encode(_) => "Encode",
        BridgeError::Unsupported(_) => "Unsupported",
        BridgeError::Io(_) => "Io",
    };
    debug!("Request failed: {}", e);
    Response::Error {
        kind: Some(kind.to_string()),
        error: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrelay_core::BridgeConfig;
    use serde_json::json;

    fn handler() -> Option<Handler> {
        let bridge = Bridge::new(BridgeConfig::from_env());
        if let Err(e) = bridge.start() {
            eprintln!("Skipping test (no usable Python interpreter): {}", e);
            return None;
        }
        Some(Handler::new(bridge))
    }

    fn value_of(response: Response) -> Json {
        match response {
            Response::Value { value } => value,
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_handle_without_peer() {
        let mut handler = Handler::new(Bridge::new(
            BridgeConfig::default().with_interpreter(["definitely-not-a-python-binary"]),
        ));
        assert!(matches!(
            handler.handle(&Request::Release { handle: 9 }),
            Response::Error { kind: Some(ref kind), .. } if kind == "StaleHandle"
        ));
        assert!(matches!(
            handler.handle(&Request::Start),
            Response::Error { kind: Some(ref kind), .. } if kind == "Spawn"
        ));
        assert!(matches!(
            handler.handle(&Request::Alive),
            Response::Alive { alive: false, pid: None, .. }
        ));
    }

    #[test]
    fn test_eval_call_and_exec() {
        let Some(mut handler) = handler() else { return };

        let value = value_of(handler.handle(&Request::Eval {
            expr: "{'a': (1, 2.5)}".to_string(),
            remote: false,
        }));
        assert_eq!(value, json!({"a": {"$tuple": [1, 2.5]}}));

        assert!(matches!(
            handler.handle(&Request::Exec {
                code: "def add(a, b=10):\n    return a + b".to_string()
            }),
            Response::Success { ok: true }
        ));

        let mut kwargs = Map::new();
        kwargs.insert("b".to_string(), json!(5));
        let value = value_of(handler.handle(&Request::Call {
            name: "add".to_string(),
            args: vec![json!(1)],
            kwargs,
            remote: false,
        }));
        assert_eq!(value, json!(6));

        match handler.handle(&Request::Eval {
            expr: "1/0".to_string(),
            remote: false,
        }) {
            Response::Error { kind, .. } => assert_eq!(kind.as_deref(), Some("ZeroDivisionError")),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_handles_lifecycle() {
        let Some(mut handler) = handler() else { return };
        handler
            .handle(&Request::Exec {
                code: "class Box:\n    def __init__(self):\n        self.v = 1".to_string(),
            });

        let boxed = value_of(handler.handle(&Request::Eval {
            expr: "Box()".to_string(),
            remote: false,
        }));
        let id = boxed["$handle"].as_u64().unwrap();
        assert_eq!(boxed["type"], json!("__main__.Box"));

        handler.handle(&Request::SetAttr {
            handle: id,
            name: "v".to_string(),
            value: json!([1, 2]),
        });
        let v = value_of(handler.handle(&Request::GetAttr {
            handle: id,
            name: "v".to_string(),
            remote: false,
        }));
        assert_eq!(v, json!([1, 2]));

        // Handles can be passed back as arguments.
        let same = value_of(handler.handle(&Request::Call {
            name: "id".to_string(),
            args: vec![boxed.clone()],
            kwargs: Map::new(),
            remote: false,
        }));
        assert!(same.is_number());

        assert!(matches!(
            handler.handle(&Request::Release { handle: id }),
            Response::Success { .. }
        ));
        assert!(matches!(
            handler.handle(&Request::GetAttr {
                handle: id,
                name: "v".to_string(),
                remote: false
            }),
            Response::Error { .. }
        ));
        let probe = format!("{} in _pyrelay_objects", id);
        let live = value_of(handler.handle(&Request::Eval {
            expr: probe,
            remote: false,
        }));
        assert_eq!(live, json!(false));
    }

    #[test]
    fn test_remote_flag_and_capture() {
        let Some(mut handler) = handler() else { return };
        let list = value_of(handler.handle(&Request::Eval {
            expr: "[1, 2, 3]".to_string(),
            remote: true,
        }));
        assert_eq!(list["type"], json!("builtins.list"));

        match handler.handle(&Request::Capture {
            code: "print('hi')".to_string(),
        }) {
            Response::Captured { output } => assert_eq!(output, "hi\n"),
            other => panic!("unexpected response {:?}", other),
        }

        assert!(matches!(handler.handle(&Request::Shutdown), Response::Success { .. }));
        assert!(handler.is_shutdown());
        assert!(matches!(
            handler.handle(&Request::Alive),
            Response::Alive { alive: false, .. }
        ));
    }
}
