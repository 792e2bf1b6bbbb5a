//! pyrelay server
//!
//! JSON-RPC front end for a Python peer. Reads one request per line from
//! stdin and writes one response per line to stdout. The interpreter and
//! array-exchange settings come from the `PYRELAY_*` environment variables.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use pyrelay_core::{Bridge, BridgeConfig};
use tracing::{debug, error, info, warn};

use crate::rpc::{Request, Response, RpcMessage};

mod convert;
mod handler;
mod rpc;

fn main() -> Result<()> {
    // stdout carries JSON-RPC, so logs go to stderr
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    info!("pyrelay-server starting...");

    let config = BridgeConfig::from_env();
    debug!("Configuration: {:?}", config);
    let bridge = Bridge::new(config);
    if let Err(e) = bridge.start() {
        warn!("Peer not started yet: {}", e);
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handler = handler::Handler::new(bridge);

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to read line: {}", e);
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        debug!("Received: {}", line);

        let response = match serde_json::from_str::<RpcMessage<Request>>(&line) {
            Ok(msg) => {
                let result = handler.handle(&msg.content);
                RpcMessage::new(msg.id.unwrap_or(0), result)
            }
            Err(e) => RpcMessage::new(0, Response::error(format!("Parse error: {}", e))),
        };

        let response_json =
            serde_json::to_string(&response).context("Failed to serialize response")?;
        debug!("Sending: {}", response_json);
        writeln!(stdout, "{}", response_json).context("Failed to write response")?;
        stdout.flush().context("Failed to flush stdout")?;

        if handler.is_shutdown() {
            break;
        }
    }

    info!("pyrelay-server shutting down");
    Ok(())
}
