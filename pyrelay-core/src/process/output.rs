//! Draining the peer's ordinary output
//!
//! Anything the peer prints outside a capture goes to its stderr pipe. A
//! background thread reads that pipe continuously so the peer never blocks
//! on a full buffer, and parks the lines in a bounded channel until someone
//! asks for them.

use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Lines kept unread before newly printed lines start being dropped.
pub const OUTPUT_BUFFER_LINES: usize = 4096;

/// Buffered output shared by every peer a bridge starts.
#[derive(Debug, Clone)]
pub struct OutputChannel {
    sender: Sender<String>,
    receiver: Receiver<String>,
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self::bounded(OUTPUT_BUFFER_LINES)
    }
}

impl OutputChannel {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Take everything buffered so far.
    pub fn drain(&self) -> Vec<String> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Start a thread copying `stream` into the channel line by line.
    pub fn attach<R>(&self, stream: R, pid: u32) -> std::io::Result<OutputDrain>
    where
        R: Read + Send + 'static,
    {
        let sender = self.sender.clone();
        let handle = thread::Builder::new()
            .name(format!("pyrelay-output-{}", pid))
            .spawn(move || pump(BufReader::new(stream), sender, pid))?;
        Ok(OutputDrain {
            handle: Some(handle),
        })
    }
}

fn pump<R: BufRead>(mut reader: R, sender: Sender<String>, pid: u32) {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                log::debug!("[peer {}] {}", pid, line);
                match sender.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(e) => {
                log::warn!("Reading output of peer {} failed: {}", pid, e);
                break;
            }
        }
    }
    if dropped > 0 {
        log::warn!(
            "Dropped {} output line(s) from peer {}; buffer was full",
            dropped,
            pid
        );
    }
    log::trace!("Output drain for peer {} finished", pid);
}

/// The background reader for one peer. Joining waits for the pipe to close.
#[derive(Debug)]
pub struct OutputDrain {
    handle: Option<JoinHandle<()>>,
}

impl OutputDrain {
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Output drain thread panicked");
            }
        }
    }
}
