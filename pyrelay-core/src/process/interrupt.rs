//! Out-of-band signals to the peer
//!
//! The pid lives in an atomic so any thread can reach a peer that another
//! thread is blocked on, without touching the process lock.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{BridgeError, Result};

#[derive(Debug, Default)]
pub struct InterruptHandle {
    /// 0 when no peer is running.
    pid: AtomicU32,
}

impl InterruptHandle {
    pub fn arm(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Raise `KeyboardInterrupt` in whatever peer code is running. The
    /// interrupted call then fails with an `Evaluation` error. A peer that is
    /// idle ignores the signal.
    pub fn interrupt(&self) -> Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| BridgeError::not_alive("no peer process to interrupt"))?;
        log::debug!("Sending SIGINT to peer {}", pid);
        signal(pid, Kind::Interrupt)
    }

    /// Terminate the peer immediately. A blocked call reports `ProcessNotAlive`.
    pub fn kill(&self) -> Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| BridgeError::not_alive("no peer process to kill"))?;
        log::info!("Killing peer {}", pid);
        signal(pid, Kind::Kill)
    }
}

enum Kind {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal(pid: u32, kind: Kind) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = match kind {
        Kind::Interrupt => Signal::SIGINT,
        Kind::Kill => Signal::SIGKILL,
    };
    let pid = i32::try_from(pid)
        .map_err(|_| BridgeError::not_alive(format!("invalid peer pid {}", pid)))?;
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(BridgeError::not_alive(format!("peer {} has exited", pid))),
        Err(errno) => Err(BridgeError::Io(errno.into())),
    }
}

#[cfg(not(unix))]
fn signal(_pid: u32, kind: Kind) -> Result<()> {
    match kind {
        Kind::Interrupt => Err(BridgeError::Unsupported("interrupting the peer")),
        Kind::Kill => Err(BridgeError::Unsupported("killing the peer out of band")),
    }
}
