//! Cross-process object handles
//!
//! Two registries live here:
//! - [`HandleTable`] tracks peer objects the host refers to by id. Each id is
//!   wrapped in a [`RemoteObject`]; dropping the last clone queues a delete
//!   message that the protocol engine flushes before its next request.
//! - [`HostStash`] keeps host objects alive while the peer holds a proxy to
//!   them. The peer tells us when its proxy is collected.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::codec::Value;
use crate::error::{BridgeError, Result};

/// Registry of peer-side objects referenced from the host.
pub struct HandleTable {
    state: Mutex<TableState>,
}

#[derive(Default)]
struct TableState {
    /// Bumped every time the peer process goes away.
    generation: u64,
    live: HashMap<u64, Weak<HandleInner>>,
    /// Ids whose last host reference was dropped, not yet sent to the peer.
    pending: Vec<u64>,
    /// Largest id interned in this generation.
    high_water: u64,
}

impl HandleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TableState::default()),
        })
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Return the live proxy for `id`, or create one.
    pub fn intern(self: &Arc<Self>, id: u64, type_name: &str) -> RemoteObject {
        let mut state = self.state.lock();

        if let Some(inner) = state.live.get(&id).and_then(Weak::upgrade) {
            return RemoteObject { inner };
        }

        // The peer handed the id out again before we told it to forget it.
        state.pending.retain(|pending| *pending != id);

        let inner = Arc::new(HandleInner {
            id,
            type_name: type_name.to_string(),
            generation: state.generation,
            table: Arc::downgrade(self),
        });
        state.live.insert(id, Arc::downgrade(&inner));
        state.high_water = state.high_water.max(id);
        RemoteObject { inner }
    }

    pub fn lookup(&self, id: u64) -> Option<RemoteObject> {
        self.state
            .lock()
            .live
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| RemoteObject { inner })
    }

    /// Id of `handle` if it still refers to the current peer process of
    /// this table. Handles from another bridge are treated as stale.
    pub fn check(&self, handle: &RemoteObject) -> Result<u64> {
        let ours = std::ptr::eq(handle.inner.table.as_ptr(), self);
        if !ours || handle.inner.generation != self.generation() {
            return Err(BridgeError::StaleHandle { id: handle.id() });
        }
        Ok(handle.id())
    }

    /// Drain the ids waiting for a delete message.
    pub fn take_pending(&self) -> Vec<u64> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Forget everything; existing proxies become stale.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.live.clear();
        state.pending.clear();
        state.high_water = 0;
    }

    pub fn high_water(&self) -> u64 {
        self.state.lock().high_water
    }

    /// Number of ids with a live host proxy.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, dying: *const HandleInner, id: u64, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        // A concurrent intern may already have replaced the entry.
        let ours = state
            .live
            .get(&id)
            .map(|w| std::ptr::eq(w.as_ptr(), dying))
            .unwrap_or(false);
        if ours {
            state.live.remove(&id);
            state.pending.push(id);
        }
    }
}

struct HandleInner {
    id: u64,
    type_name: String,
    generation: u64,
    table: Weak<HandleTable>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.release(self as *const HandleInner, self.id, self.generation);
        }
    }
}

/// Host-side proxy for a peer object. Cheap to clone; the peer object is
/// released once every clone is gone.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<HandleInner>,
}

impl RemoteObject {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Qualified Python type name reported by the peer.
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
            && self.inner.generation == other.inner.generation
            && Weak::ptr_eq(&self.inner.table, &other.inner.table)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("id", &self.inner.id)
            .field("type_name", &self.inner.type_name)
            .field("generation", &self.inner.generation)
            .finish()
    }
}

/// A host value the peer may hold a reference to but never copies.
pub trait HostObject: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    /// Attribute read from peer code. `None` becomes an `AttributeError`.
    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// Shared reference to a [`HostObject`]. Equality is identity.
#[derive(Clone)]
pub struct HostRef(Arc<dyn HostObject>);

impl HostRef {
    pub fn new(object: impl HostObject) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn HostObject>) -> Self {
        Self(object)
    }

    pub fn object(&self) -> &Arc<dyn HostObject> {
        &self.0
    }

    pub fn type_name(&self) -> &str {
        self.0.type_name()
    }

    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        self.addr() == other.addr()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for HostRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({} @ 0x{:x})", self.type_name(), self.addr())
    }
}

/// Host objects currently referenced by the peer, keyed by the id the peer sees.
#[derive(Default)]
pub struct HostStash {
    by_id: HashMap<u64, HostRef>,
    by_addr: HashMap<usize, u64>,
    next_id: u64,
}

impl HostStash {
    /// Id for `object`, reusing the existing one if it is already stashed.
    pub fn stash(&mut self, object: &HostRef) -> u64 {
        if let Some(id) = self.by_addr.get(&object.addr()) {
            return *id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.by_addr.insert(object.addr(), id);
        self.by_id.insert(id, object.clone());
        id
    }

    pub fn get(&self, id: u64) -> Option<&HostRef> {
        self.by_id.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<HostRef> {
        let object = self.by_id.remove(&id)?;
        self.by_addr.remove(&object.addr());
        Some(object)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point;

    impl HostObject for Point {
        fn type_name(&self) -> &str {
            "Point"
        }
    }

    #[test]
    fn test_intern_is_idempotent_while_alive() {
        let table = HandleTable::new();
        let a = table.intern(7, "builtins.object");
        let b = table.intern(7, "builtins.object");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drop_queues_delete() {
        let table = HandleTable::new();
        let a = table.intern(3, "builtins.object");
        let b = a.clone();
        drop(a);
        assert!(table.take_pending().is_empty());
        drop(b);
        assert_eq!(table.take_pending(), vec![3]);
        assert!(table.lookup(3).is_none());
    }

    #[test]
    fn test_reintern_cancels_pending_delete() {
        let table = HandleTable::new();
        drop(table.intern(5, "x"));
        assert_eq!(table.pending_len(), 1);
        let again = table.intern(5, "x");
        assert_eq!(table.pending_len(), 0);
        assert_eq!(again.id(), 5);
    }

    #[test]
    fn test_invalidate_makes_handles_stale() {
        let table = HandleTable::new();
        let handle = table.intern(1, "x");
        assert_eq!(table.check(&handle).unwrap(), 1);

        table.invalidate();
        assert!(matches!(
            table.check(&handle),
            Err(BridgeError::StaleHandle { id: 1 })
        ));

        // Dropping a stale handle must not queue anything for the new peer.
        drop(handle);
        assert!(table.take_pending().is_empty());
    }

    #[test]
    fn test_handles_belong_to_one_table() {
        let a = HandleTable::new();
        let b = HandleTable::new();
        let from_a = a.intern(1, "x");
        let from_b = b.intern(1, "x");

        assert_eq!(a.check(&from_a).unwrap(), 1);
        assert!(matches!(
            b.check(&from_a),
            Err(BridgeError::StaleHandle { id: 1 })
        ));
        assert_ne!(from_a, from_b);
    }

    #[test]
    fn test_high_water_tracks_largest_id() {
        let table = HandleTable::new();
        let _a = table.intern(4, "x");
        let _b = table.intern(2, "x");
        assert_eq!(table.high_water(), 4);
        table.invalidate();
        assert_eq!(table.high_water(), 0);
    }

    #[test]
    fn test_stash_reuses_ids() {
        let mut stash = HostStash::default();
        let p = HostRef::new(Point);
        let q = HostRef::new(Point);

        let id = stash.stash(&p);
        assert_eq!(stash.stash(&p.clone()), id);
        assert_ne!(stash.stash(&q), id);
        assert_eq!(stash.len(), 2);

        assert!(stash.remove(id).unwrap().ptr_eq(&p));
        assert!(stash.get(id).is_none());
        assert_ne!(stash.stash(&p), id);
    }
}
