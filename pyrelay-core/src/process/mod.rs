//! Peer process management
//!
//! A [`PeerProcess`] owns one Python interpreter running the embedded peer
//! runtime. Its stdin/stdout carry protocol frames; its stderr carries the
//! ordinary output of user code and is drained by a background thread.

mod interrupt;
mod output;

use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{Decoder, Value};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handles::{HandleTable, HostStash};
use crate::protocol::Reply;

pub use interrupt::InterruptHandle;
pub use output::{OutputChannel, OutputDrain, OUTPUT_BUFFER_LINES};

const PEER_RUNTIME: &str = include_str!("../peer/runtime.py");

/// How long `shutdown` waits for the peer to exit on its own.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct PeerProcess {
    child: Child,
    pid: u32,
    writer: BufWriter<ChildStdin>,
    reader: BufReader<ChildStdout>,
    _drain: OutputDrain,
    /// Host objects the peer currently holds proxies for.
    pub(crate) stash: HostStash,
    broken: Option<String>,
    version: String,
}

impl PeerProcess {
    /// Launch the interpreter and wait for the runtime's handshake.
    pub fn spawn(
        config: &BridgeConfig,
        handles: &Arc<HandleTable>,
        output: &OutputChannel,
    ) -> Result<Self> {
        let (program, extra_args) = config.interpreter.split_first().ok_or_else(|| {
            BridgeError::Spawn {
                program: String::new(),
                source: std::io::Error::new(ErrorKind::InvalidInput, "empty interpreter command"),
            }
        })?;
        let settings = serde_json::to_string(&config.peer_settings())
            .map_err(|e| BridgeError::Encode(e.to_string()))?;

        let mut child = Command::new(program)
            .args(extra_args)
            .arg("-u")
            .arg("-c")
            .arg(PEER_RUNTIME)
            .arg(settings)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BridgeError::not_alive("peer pipes were not created"));
            }
        };
        let drain = match output.attach(stderr, pid) {
            Ok(drain) => drain,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let mut peer = PeerProcess {
            child,
            pid,
            writer: BufWriter::new(stdin),
            reader: BufReader::new(stdout),
            _drain: drain,
            stash: HostStash::default(),
            broken: None,
            version: String::new(),
        };

        match peer.handshake(handles) {
            Ok(version) => {
                log::info!("Started peer {} (Python {})", pid, version);
                peer.version = version;
                Ok(peer)
            }
            Err(e) => {
                let PeerProcess {
                    mut child, _drain, ..
                } = peer;
                let _ = child.kill();
                let _ = child.wait();
                _drain.join();
                let stderr = output.drain();
                log::warn!("Peer {} failed to start: {}", pid, e);
                Err(BridgeError::not_alive(if stderr.is_empty() {
                    format!("peer failed to start: {}", e)
                } else {
                    format!("peer failed to start: {}\n{}", e, stderr.join("\n"))
                }))
            }
        }
    }

    fn handshake(&mut self, handles: &Arc<HandleTable>) -> Result<String> {
        let line = self.read_line()?;
        let stash = HostStash::default();
        match Reply::parse(&line, &Decoder::new(handles, &stash))? {
            Reply::Return(Value::Str(version)) => Ok(version),
            other => Err(BridgeError::framing(format!(
                "expected handshake, got {:?}",
                other
            ))),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Python version reported during the handshake.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Write one complete frame and flush it.
    pub fn write_frame(&mut self, frame: &str) -> Result<()> {
        if let Some(reason) = &self.broken {
            return Err(BridgeError::not_alive(reason.clone()));
        }
        log::trace!("-> {}", frame.trim_end());
        let written = self
            .writer
            .write_all(frame.as_bytes())
            .and_then(|()| self.writer.flush());
        written.map_err(|e| {
            let reason = format!("writing to peer {} failed: {}", self.pid, e);
            self.mark_broken(&reason);
            BridgeError::not_alive(reason)
        })
    }

    /// Read one frame, without its trailing newline.
    pub fn read_line(&mut self) -> Result<String> {
        if let Some(reason) = &self.broken {
            return Err(BridgeError::not_alive(reason.clone()));
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                let reason = match self.child.try_wait() {
                    Ok(Some(status)) => format!("peer {} exited ({})", self.pid, status),
                    _ => format!("peer {} closed its protocol stream", self.pid),
                };
                self.mark_broken(&reason);
                Err(BridgeError::not_alive(reason))
            }
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                }
                log::trace!("<- {}", line);
                Ok(line)
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                let reason = format!("peer {} sent invalid UTF-8", self.pid);
                self.mark_broken(&reason);
                Err(BridgeError::framing(reason))
            }
            Err(e) => {
                let reason = format!("reading from peer {} failed: {}", self.pid, e);
                self.mark_broken(&reason);
                Err(BridgeError::not_alive(reason))
            }
        }
    }

    /// Record that the protocol stream can no longer be trusted.
    pub fn mark_broken(&mut self, reason: &str) {
        if self.broken.is_none() {
            log::warn!("Peer {} is unusable: {}", self.pid, reason);
            self.broken = Some(reason.to_string());
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Whether the child is still running and its stream is intact.
    pub fn is_running(&mut self) -> bool {
        self.broken.is_none() && matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the peer to quit, then kill it if it lingers past `grace`.
    pub fn shutdown(mut self, grace: Duration) {
        if self.broken.is_none() {
            let _ = self
                .writer
                .write_all(b"q\n")
                .and_then(|()| self.writer.flush());
        }
        let PeerProcess {
            mut child,
            pid,
            writer,
            reader,
            ..
        } = self;
        // Closing stdin makes the runtime exit even if it missed the quit frame.
        drop(writer);

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("Peer {} exited ({})", pid, status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => {
                    log::warn!("Peer {} did not exit within {:?}; killing it", pid, grace);
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                Err(e) => {
                    log::warn!("Waiting for peer {} failed: {}", pid, e);
                    let _ = child.kill();
                    break;
                }
            }
        }
        drop(reader);
    }

    /// Kill the child without the quit handshake.
    pub fn kill(mut self) {
        log::info!("Killing peer {}", self.pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl std::fmt::Debug for PeerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProcess")
            .field("pid", &self.pid)
            .field("version", &self.version)
            .field("broken", &self.broken)
            .finish()
    }
}
