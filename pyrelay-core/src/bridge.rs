//! The bridge: one host-side handle on one (restartable) peer process

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::codec::Value;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handles::{HandleTable, RemoteObject};
use crate::process::{InterruptHandle, OutputChannel, PeerProcess, SHUTDOWN_GRACE};
use crate::protocol::{CallArgs, Callback, Session};

/// State shared by every session of a bridge, independent of which peer
/// process is currently running.
pub(crate) struct BridgeState {
    pub(crate) config: RwLock<BridgeConfig>,
    pub(crate) callbacks: RwLock<HashMap<String, Arc<Callback>>>,
    pub(crate) handles: Arc<HandleTable>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) output: OutputChannel,
}

struct Inner {
    /// The process lock. Held for the whole of every top-level exchange.
    process: Mutex<Option<PeerProcess>>,
    /// Thread currently holding `process`.
    owner: Mutex<Option<ThreadId>>,
    state: BridgeState,
}

/// The process lock, remembering its holder until released.
struct ProcessGuard<'a> {
    guard: MutexGuard<'a, Option<PeerProcess>>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Deref for ProcessGuard<'_> {
    type Target = Option<PeerProcess>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ProcessGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock() = None;
    }
}

impl Inner {
    /// Tear a peer down and forget everything tied to its lifetime.
    fn retire(&self, peer: PeerProcess, graceful: bool) {
        self.state.interrupt.disarm();
        if graceful {
            peer.shutdown(SHUTDOWN_GRACE);
        } else {
            peer.kill();
        }
        self.state.handles.invalidate();
        self.state.callbacks.write().clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(peer) = self.process.get_mut().take() {
            self.retire(peer, true);
        }
    }
}

/// Drives a Python peer process.
///
/// Cloning is cheap and clones share the same peer. Every request takes the
/// process lock for its whole exchange, so calls from different threads are
/// serialized; [`Bridge::interrupt`] and [`Bridge::kill`] bypass the lock.
///
/// ```no_run
/// use pyrelay_core::{Bridge, BridgeConfig, Value};
///
/// let bridge = Bridge::new(BridgeConfig::default());
/// assert_eq!(bridge.evaluate("1 + 2 * 3")?, Value::Int(7));
/// # Ok::<(), pyrelay_core::BridgeError>(())
/// ```
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("pid", &self.inner.state.interrupt.pid())
            .field("config", &*self.inner.state.config.read())
            .finish()
    }
}

impl Bridge {
    /// Create a bridge. The peer starts lazily on first use.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                process: Mutex::new(None),
                owner: Mutex::new(None),
                state: BridgeState {
                    config: RwLock::new(config),
                    callbacks: RwLock::new(HashMap::new()),
                    handles: HandleTable::new(),
                    interrupt: InterruptHandle::default(),
                    output: OutputChannel::default(),
                },
            }),
        }
    }

    pub fn from_env() -> Self {
        Self::new(BridgeConfig::from_env())
    }

    /// Start the peer if it is not already running.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.lock_process()?;
        self.ensure_running(&mut guard).map(drop)
    }

    /// Stop the peer. Every [`RemoteObject`] becomes stale and registered
    /// callbacks are forgotten. Stopping a stopped bridge does nothing.
    pub fn stop(&self) {
        let mut guard = match self.lock_process() {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Ignoring stop: {}", e);
                return;
            }
        };
        if let Some(peer) = guard.take() {
            log::info!("Stopping peer {}", peer.pid());
            self.inner.retire(peer, true);
        }
    }

    pub fn is_alive(&self) -> bool {
        match self.inner.process.try_lock() {
            Some(mut guard) => guard.as_mut().map_or(false, PeerProcess::is_running),
            // Someone is mid-call, so a peer exists.
            None => self.inner.state.interrupt.pid().is_some(),
        }
    }

    /// Raise `KeyboardInterrupt` in the running peer call. Safe to call from
    /// any thread while another thread is blocked in a request.
    pub fn interrupt(&self) -> Result<()> {
        self.inner.state.interrupt.interrupt()
    }

    /// Kill the peer outright. A call blocked on it fails with
    /// [`BridgeError::ProcessNotAlive`]; the next call starts a new peer.
    pub fn kill(&self) -> Result<()> {
        self.inner.state.interrupt.kill()
    }

    /// Pid of the running peer, if any.
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.interrupt.pid()
    }

    /// Python version of the running peer. `None` when called from inside
    /// a session; use [`Session::peer_version`] there.
    pub fn peer_version(&self) -> Option<String> {
        self.lock_process()
            .ok()?
            .as_ref()
            .map(|peer| peer.version().to_string())
    }

    /// Run `f` with exclusive use of the peer, starting it first if needed.
    /// Requests made through the session do not re-take the process lock.
    ///
    /// Calling back into the `Bridge` from inside `f` (or from a callback)
    /// on the same thread fails with [`BridgeError::Reentrant`]; use the
    /// session instead.
    pub fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        let mut guard = self.lock_process()?;
        let peer = self.ensure_running(&mut guard)?;
        let result = f(&mut Session::new(&self.inner.state, peer));
        self.retire_if_broken(&mut guard);
        result
    }

    pub fn evaluate(&self, expr: &str) -> Result<Value> {
        self.with_session(|session| session.evaluate(expr))
    }

    pub fn execute(&self, code: &str) -> Result<()> {
        self.with_session(|session| session.execute(code))
    }

    pub fn call(&self, name: &str, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value> {
        self.with_session(|session| session.call(name, args, kwargs))
    }

    pub fn get_attribute(&self, target: &RemoteObject, name: &str) -> Result<Value> {
        self.with_session(|session| session.get_attribute(target, name))
    }

    pub fn set_attribute(&self, target: &RemoteObject, name: &str, value: &Value) -> Result<()> {
        self.with_session(|session| session.set_attribute(target, name, value))
    }

    /// See [`Session::register_callback`]. Registrations last until the
    /// peer stops.
    pub fn register_callback<F>(&self, name: &str, callback: F) -> Result<()>
    where
        F: Fn(&mut Session<'_>, CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_session(|session| session.register_callback(name, callback))
    }

    /// See [`Session::capture_output`].
    pub fn capture_output<T, F>(&self, f: F) -> Result<(T, String)>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        self.with_session(|session| session.capture_output(f))
    }

    /// See [`Session::with_remote_objects`].
    pub fn with_remote_objects<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        self.with_session(|session| session.with_remote_objects(f))
    }

    /// See [`Session::with_remote_objects_value`].
    pub fn with_remote_objects_value<F>(&self, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Session<'_>) -> Result<Value>,
    {
        self.with_session(|session| session.with_remote_objects_value(f))
    }

    /// Output the peer printed outside any capture, oldest first.
    pub fn drain_output(&self) -> Vec<String> {
        self.inner.state.output.drain()
    }

    pub fn config(&self) -> BridgeConfig {
        self.inner.state.config.read().clone()
    }

    /// Change the configuration. Array settings reach a running peer
    /// immediately; a changed interpreter applies from the next start.
    pub fn update_config<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BridgeConfig),
    {
        let mut guard = self.lock_process()?;
        f(&mut *self.inner.state.config.write());

        let result = match guard.as_mut() {
            Some(peer) => {
                if peer.is_running() {
                    Session::new(&self.inner.state, peer).push_config()
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        };
        self.retire_if_broken(&mut guard);
        result
    }

    /// Take the process lock, refusing instead of deadlocking when this
    /// thread already holds it.
    fn lock_process(&self) -> Result<ProcessGuard<'_>> {
        let me = thread::current().id();
        if *self.inner.owner.lock() == Some(me) {
            return Err(BridgeError::Reentrant);
        }
        let guard = self.inner.process.lock();
        *self.inner.owner.lock() = Some(me);
        Ok(ProcessGuard {
            guard,
            owner: &self.inner.owner,
        })
    }

    fn ensure_running<'g>(&self, slot: &'g mut Option<PeerProcess>) -> Result<&'g mut PeerProcess> {
        let healthy = matches!(slot.as_mut().map(PeerProcess::is_running), Some(true));
        if !healthy {
            if let Some(dead) = slot.take() {
                log::warn!("Peer {} is gone; starting a new one", dead.pid());
                self.inner.retire(dead, false);
            }
            let state = &self.inner.state;
            let config = state.config.read().clone();
            let peer = PeerProcess::spawn(&config, &state.handles, &state.output)?;
            state.interrupt.arm(peer.pid());
            return Ok(slot.insert(peer));
        }
        slot.as_mut()
            .ok_or_else(|| BridgeError::not_alive("peer disappeared while locked"))
    }

    fn retire_if_broken(&self, slot: &mut Option<PeerProcess>) {
        if slot.as_ref().map_or(false, PeerProcess::is_broken) {
            if let Some(peer) = slot.take() {
                self.inner.retire(peer, false);
            }
        }
    }
}
