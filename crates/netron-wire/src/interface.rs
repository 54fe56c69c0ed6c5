//! Interface proxies, local stand-ins for contexts living on a peer.
//!
//! An [`Interface`] is bound to `(peer, definition)`. Every member access is
//! an explicit [`invoke`](Interface::invoke) or [`assign`](Interface::assign)
//! that the owning peer turns into a request. Handles on the same definition
//! share one bookkeeping entry in the peer's [`InterfaceTable`]; the entry
//! goes away when the last handle is dropped, the definition stays.

use crate::context::Value;
use crate::peer::Peer;
use netron_types::{DefId, Definition, NetronError, NetronResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A handle on a remote (or local) context.
pub struct Interface {
    peer: Arc<dyn Peer>,
    definition: Definition,
}

impl Interface {
    /// Bind a handle and record it in the peer's interface table.
    pub fn bind(peer: Arc<dyn Peer>, definition: Definition) -> Self {
        peer.interfaces().acquire(&definition);
        Self { peer, definition }
    }

    /// Id of the definition this handle is bound to.
    pub fn def_id(&self) -> DefId {
        self.definition.id
    }

    /// The definition this handle is bound to.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// The peer owning the context.
    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Id of the peer owning the context.
    pub fn peer_id(&self) -> &str {
        self.peer.id()
    }

    /// Call a method or read a property.
    pub async fn invoke(&self, member: &str, args: Value) -> NetronResult<Value> {
        self.check_member(member)?;
        self.peer.invoke(self.def_id(), member, args).await
    }

    /// Write a property or call a method without waiting for a result value.
    pub async fn assign(&self, member: &str, value: Value) -> NetronResult<()> {
        self.check_member(member)?;
        self.peer.assign(self.def_id(), member, value).await
    }

    /// Call a method with positional arguments.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.invoke(method, Value::List(args)).await
    }

    /// Call a method with positional arguments, discarding the result.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.assign(method, Value::List(args)).await
    }

    /// Read a property.
    pub async fn get(&self, property: &str) -> NetronResult<Value> {
        self.invoke(property, Value::null()).await
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: impl Into<Value> + Send) -> NetronResult<()> {
        self.assign(property, value.into()).await
    }

    /// Give this handle back to the owning peer. Dropping it does the same
    /// without the ownership check.
    pub fn release(self) -> NetronResult<()> {
        let peer = Arc::clone(&self.peer);
        peer.release_interface(self)
    }

    fn check_member(&self, member: &str) -> NetronResult<()> {
        if self.definition.has_member(member) {
            Ok(())
        } else {
            Err(NetronError::InvalidArgument(format!(
                "'{member}' is not a public member of {}",
                self.definition.name
            )))
        }
    }
}

impl Clone for Interface {
    fn clone(&self) -> Self {
        Self::bind(Arc::clone(&self.peer), self.definition.clone())
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        // Acquired in `bind`, so the entry is present.
        let _ = self.peer.interfaces().release(self.definition.id);
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("peer", &self.peer.id())
            .field("def_id", &self.definition.id)
            .field("name", &self.definition.name)
            .finish()
    }
}

#[derive(Debug)]
struct InterfaceEntry {
    definition: Definition,
    handles: usize,
}

/// Per-peer bookkeeping of live interface handles, keyed by definition id.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    entries: Mutex<HashMap<DefId, InterfaceEntry>>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more handle on `definition`.
    pub fn acquire(&self, definition: &Definition) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(definition.id)
            .or_insert_with(|| InterfaceEntry {
                definition: definition.clone(),
                handles: 0,
            })
            .handles += 1;
    }

    /// Forget one handle. The entry is removed with the last one.
    pub(crate) fn release(&self, def_id: DefId) -> NetronResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(&def_id).ok_or_else(|| {
            NetronError::InvalidArgument(format!("No interface for definition {def_id}"))
        })?;
        entry.handles -= 1;
        if entry.handles == 0 {
            entries.remove(&def_id);
        }
        Ok(())
    }

    /// Whether any handle on `def_id` is live.
    pub fn contains(&self, def_id: DefId) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&def_id)
    }

    /// Number of live handles on `def_id`.
    pub fn handles(&self, def_id: DefId) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&def_id).map(|e| e.handles).unwrap_or(0)
    }

    /// Definition behind a live entry.
    pub fn definition(&self, def_id: DefId) -> Option<Definition> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&def_id).map(|e| e.definition.clone())
    }

    /// Number of entries (distinct definitions).
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::ContextDescriptor;

    fn def(id: DefId) -> Definition {
        Definition::strong(id, "calc", &ContextDescriptor::new("Calculator"))
    }

    #[test]
    fn test_entry_counts_handles() {
        let table = InterfaceTable::new();
        table.acquire(&def(1));
        table.acquire(&def(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.handles(1), 2);

        table.release(1).unwrap();
        assert!(table.contains(1));
        table.release(1).unwrap();
        assert!(!table.contains(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_untracked() {
        let table = InterfaceTable::new();
        match table.release(7) {
            Err(NetronError::InvalidArgument(_)) => {}
            other => panic!("Expected InvalidArgument, got {other:?}"),
        }
    }
}
