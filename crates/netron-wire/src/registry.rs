//! Definition registry: the local table of remotely addressable contexts.
//!
//! Every context this node exposes, strong or weak, is held as a stub keyed
//! by its definition id. Strong contexts are also indexed by name and
//! announced to every subscribed connection; weak ones are minted on demand
//! when an object crosses the wire by reference and are never announced.
//!
//! All mutation goes through one mutex. Announcements are queued on each
//! connection's outbox while it is held, so every peer sees attach and
//! detach in the order they happened here.

use crate::context::{same_context, Context, Value};
use crate::events::{PeerEvents, RemoteEvent};
use crate::interface::Interface;
use crate::message::{WireMessage, WireNotification};
use netron_types::{ContextDescriptor, DefId, Definition, NetronError, NetronResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a stub dispatches to.
#[derive(Clone)]
pub enum StubTarget {
    /// A context living in this process.
    Local(Arc<dyn Context>),
    /// An interface on another peer; calls are relayed to it.
    Forwarded(Arc<Interface>),
}

impl std::fmt::Debug for StubTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(ctx) => f.debug_tuple("Local").field(&ctx.descriptor().name).finish(),
            Self::Forwarded(iface) => f.debug_tuple("Forwarded").field(iface).finish(),
        }
    }
}

/// A registered definition and the object behind it.
#[derive(Debug, Clone)]
pub struct Stub {
    pub definition: Definition,
    pub target: StubTarget,
    /// Peer the definition was handed to; `None` for strong contexts.
    pub issued_to: Option<String>,
}

struct RegistryState {
    next_id: DefId,
    contexts: BTreeMap<String, DefId>,
    stubs: HashMap<DefId, Stub>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<WireMessage>>,
    next_subscriber: u64,
}

impl RegistryState {
    fn mint(&mut self) -> DefId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn broadcast(&mut self, notification: WireNotification) {
        let msg = WireMessage::notification(notification);
        // A closed outbox belongs to a connection that is going away.
        self.subscribers.retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    /// Remove weak stubs produced, directly or transitively, by `roots`.
    fn release_originated(&mut self, roots: &[DefId]) -> Vec<Stub> {
        let mut origins: HashSet<DefId> = roots.iter().copied().collect();
        let mut released = Vec::new();
        loop {
            let children: Vec<DefId> = self
                .stubs
                .values()
                .filter(|s| {
                    s.definition.weak
                        && s.definition
                            .parent_id
                            .is_some_and(|parent| origins.contains(&parent))
                })
                .map(|s| s.definition.id)
                .collect();
            if children.is_empty() {
                break;
            }
            for id in children {
                origins.insert(id);
                if let Some(stub) = self.stubs.remove(&id) {
                    released.push(stub);
                }
            }
        }
        released
    }
}

/// The per-process table of exposed contexts.
pub struct DefinitionRegistry {
    state: Mutex<RegistryState>,
    events: PeerEvents,
}

impl DefinitionRegistry {
    /// Create an empty registry. Definition ids start at 1.
    pub fn new(event_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                contexts: BTreeMap::new(),
                stubs: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 1,
            }),
            events: PeerEvents::new(event_capacity),
        }
    }

    /// Attach a local context under `ctx_id` and announce it.
    pub fn attach(&self, ctx_id: &str, ctx: Arc<dyn Context>) -> NetronResult<Definition> {
        let descriptor = ctx.descriptor();
        self.attach_target(ctx_id, &descriptor, StubTarget::Local(ctx), false)
    }

    /// Publish an interface on another peer as a strong context of this
    /// node. Calls on it are relayed to the owner.
    pub fn attach_forwarded(&self, ctx_id: &str, iface: Interface) -> NetronResult<Definition> {
        if iface.peer().is_local() {
            // Our own context under a second name.
            let target = self.target(iface.def_id())?.1;
            let descriptor = iface.definition().descriptor();
            let def = self.attach_target(ctx_id, &descriptor, target, false)?;
            iface.release()?;
            return Ok(def);
        }
        let descriptor = iface.definition().descriptor();
        self.attach_target(ctx_id, &descriptor, StubTarget::Forwarded(Arc::new(iface)), true)
    }

    fn attach_target(
        &self,
        ctx_id: &str,
        descriptor: &ContextDescriptor,
        target: StubTarget,
        remote: bool,
    ) -> NetronResult<Definition> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.contexts.contains_key(ctx_id) {
            // A forwarded target's handle goes back to its peer on drop.
            return Err(NetronError::ContextExists(ctx_id.to_string()));
        }

        let id = state.mint();
        let mut definition = Definition::strong(id, ctx_id, descriptor);
        definition.remote = remote;
        state.contexts.insert(ctx_id.to_string(), id);
        state.stubs.insert(
            id,
            Stub {
                definition: definition.clone(),
                target,
                issued_to: None,
            },
        );

        info!(ctx_id, def_id = id, remote, "Netron: context attached");
        state.broadcast(WireNotification::ContextAttach {
            ctx_id: ctx_id.to_string(),
            definition: definition.clone(),
        });
        self.events.publish(RemoteEvent::ContextAttach {
            ctx_id: ctx_id.to_string(),
            definition: definition.clone(),
        });
        Ok(definition)
    }

    /// Detach a strong context, announce it, and release every weak
    /// definition it produced.
    pub fn detach(&self, ctx_id: &str) -> NetronResult<Definition> {
        let (stub, originated) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state
                .contexts
                .remove(ctx_id)
                .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string()))?;
            let stub = state
                .stubs
                .remove(&id)
                .ok_or(NetronError::UnknownDefinition(id))?;
            let originated = state.release_originated(&[id]);

            info!(
                ctx_id,
                def_id = id,
                released = originated.len(),
                "Netron: context detached"
            );
            state.broadcast(WireNotification::ContextDetach {
                ctx_id: ctx_id.to_string(),
                def_id: id,
            });
            self.events.publish(RemoteEvent::ContextDetach {
                ctx_id: ctx_id.to_string(),
                def_id: id,
            });
            (stub, originated)
        };

        // Forwarded handles are dropped outside the registry lock.
        let definition = stub.definition.clone();
        drop(stub);
        drop(originated);
        Ok(definition)
    }

    /// Detach every strong context. Returns the detached names.
    pub fn detach_all(&self) -> Vec<String> {
        let names = self.context_names();
        names
            .into_iter()
            .filter(|name| self.detach(name).is_ok())
            .collect()
    }

    /// Mint (or reuse) a weak definition for a local object handed to
    /// `issued_to`.
    pub fn attach_weak(
        &self,
        ctx: Arc<dyn Context>,
        parent_id: Option<DefId>,
        issued_to: &str,
    ) -> Definition {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let existing = state.stubs.values().find(|s| {
            s.definition.weak
                && s.issued_to.as_deref() == Some(issued_to)
                && matches!(&s.target, StubTarget::Local(c) if same_context(c, &ctx))
        });
        if let Some(stub) = existing {
            return stub.definition.clone();
        }

        let id = state.mint();
        let definition = Definition::weak(id, parent_id, &ctx.descriptor());
        debug!(def_id = id, ?parent_id, peer = issued_to, "Netron: weak definition minted");
        state.stubs.insert(
            id,
            Stub {
                definition: definition.clone(),
                target: StubTarget::Local(ctx),
                issued_to: Some(issued_to.to_string()),
            },
        );
        definition
    }

    /// Wrap an interface on another peer in a remote stub so it can be
    /// handed to `issued_to`. The stub's definition is weak, `$remote`, and
    /// linked to `parent_id`.
    pub fn forward(
        &self,
        iface: Interface,
        parent_id: Option<DefId>,
        issued_to: &str,
    ) -> Definition {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let existing = state.stubs.values().find(|s| {
            s.issued_to.as_deref() == Some(issued_to)
                && matches!(&s.target, StubTarget::Forwarded(t)
                    if t.def_id() == iface.def_id() && t.peer_id() == iface.peer_id())
        });
        if let Some(stub) = existing {
            let definition = stub.definition.clone();
            drop(state);
            // The stub already holds a handle on this definition.
            drop(iface);
            return definition;
        }

        let id = state.mint();
        let definition =
            Definition::weak(id, parent_id, &iface.definition().descriptor()).into_remote();
        debug!(
            def_id = id,
            ?parent_id,
            origin = iface.peer_id(),
            origin_def = iface.def_id(),
            peer = issued_to,
            "Netron: remote stub minted"
        );
        state.stubs.insert(
            id,
            Stub {
                definition: definition.clone(),
                target: StubTarget::Forwarded(Arc::new(iface)),
                issued_to: Some(issued_to.to_string()),
            },
        );
        definition
    }

    /// Register a connection's outbox for announcements. Returns the
    /// subscription id and the strong definitions current at that instant;
    /// every later change reaches the outbox.
    pub fn subscribe(&self, outbox: mpsc::UnboundedSender<WireMessage>) -> (u64, Vec<Definition>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let sub_id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(sub_id, outbox);
        let snapshot = state
            .contexts
            .values()
            .filter_map(|id| state.stubs.get(id))
            .map(|s| s.definition.clone())
            .collect();
        (sub_id, snapshot)
    }

    pub fn unsubscribe(&self, sub_id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscribers.remove(&sub_id);
    }

    /// Release the weak stubs handed to `peer_id` or relaying to it.
    pub fn release_peer(&self, peer_id: &str) -> usize {
        let released: Vec<Stub> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<DefId> = state
                .stubs
                .values()
                .filter(|s| {
                    s.definition.weak
                        && (s.issued_to.as_deref() == Some(peer_id)
                            || matches!(&s.target, StubTarget::Forwarded(t) if t.peer_id() == peer_id))
                })
                .map(|s| s.definition.id)
                .collect();
            ids.iter().filter_map(|id| state.stubs.remove(id)).collect()
        };
        let count = released.len();
        drop(released);
        if count > 0 {
            debug!(peer = peer_id, count, "Netron: released stubs of peer");
        }
        count
    }

    /// Release one weak stub.
    pub fn release(&self, def_id: DefId) -> NetronResult<()> {
        let stub = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.stubs.get(&def_id) {
                Some(s) if s.definition.weak => {}
                Some(_) => {
                    return Err(NetronError::InvalidArgument(format!(
                        "Definition {def_id} is a strong context, detach it instead"
                    )))
                }
                None => return Err(NetronError::UnknownDefinition(def_id)),
            }
            state.stubs.remove(&def_id)
        };
        drop(stub);
        Ok(())
    }

    /// Definition and target of a stub.
    pub fn target(&self, def_id: DefId) -> NetronResult<(Definition, StubTarget)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .stubs
            .get(&def_id)
            .map(|s| (s.definition.clone(), s.target.clone()))
            .ok_or(NetronError::UnknownDefinition(def_id))
    }

    /// Look up any registered definition.
    pub fn definition(&self, def_id: DefId) -> Option<Definition> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stubs.get(&def_id).map(|s| s.definition.clone())
    }

    /// Definition of a strong context.
    pub fn context_definition(&self, ctx_id: &str) -> Option<Definition> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .contexts
            .get(ctx_id)
            .and_then(|id| state.stubs.get(id))
            .map(|s| s.definition.clone())
    }

    /// Names of the strong contexts, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.contexts.keys().cloned().collect()
    }

    pub fn has_context(&self, ctx_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.contexts.contains_key(ctx_id)
    }

    pub fn has_contexts(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.contexts.is_empty()
    }

    /// Strong definitions, ordered by name.
    pub fn strong_definitions(&self) -> Vec<Definition> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .contexts
            .values()
            .filter_map(|id| state.stubs.get(id))
            .map(|s| s.definition.clone())
            .collect()
    }

    /// Ids of the weak stubs handed to `peer_id`.
    pub fn issued_to(&self, peer_id: &str) -> Vec<DefId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<DefId> = state
            .stubs
            .values()
            .filter(|s| s.issued_to.as_deref() == Some(peer_id))
            .map(|s| s.definition.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Total number of stubs, strong and weak.
    pub fn stub_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stubs.len()
    }

    /// Number of live announcement subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscribers.len()
    }

    /// Local attach/detach events.
    pub fn events(&self) -> &PeerEvents {
        &self.events
    }

    /// Run an invoke against a stub.
    pub async fn dispatch_invoke(
        &self,
        def_id: DefId,
        member: &str,
        args: Value,
    ) -> NetronResult<Value> {
        match self.resolve_member(def_id, member)? {
            StubTarget::Local(ctx) => ctx.invoke(member, args).await.map_err(NetronError::Remote),
            StubTarget::Forwarded(iface) => iface.invoke(member, args).await,
        }
    }

    /// Run an assign against a stub.
    pub async fn dispatch_assign(
        &self,
        def_id: DefId,
        member: &str,
        value: Value,
    ) -> NetronResult<()> {
        match self.resolve_member(def_id, member)? {
            StubTarget::Local(ctx) => ctx.assign(member, value).await.map_err(NetronError::Remote),
            StubTarget::Forwarded(iface) => iface.assign(member, value).await,
        }
    }

    fn resolve_member(&self, def_id: DefId, member: &str) -> NetronResult<StubTarget> {
        let (definition, target) = self.target(def_id)?;
        if !definition.has_member(member) {
            return Err(NetronError::InvalidArgument(format!(
                "'{member}' is not a public member of {}",
                definition.name
            )));
        }
        Ok(target)
    }
}

impl std::fmt::Debug for DefinitionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("DefinitionRegistry")
            .field("contexts", &state.contexts)
            .field("stubs", &state.stubs.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessageKind;
    use crate::peer::{OwnPeer, Peer};
    use async_trait::async_trait;
    use netron_types::RemoteError;
    use serde_json::json;

    struct Counter;

    #[async_trait]
    impl Context for Counter {
        fn descriptor(&self) -> ContextDescriptor {
            ContextDescriptor::new("Counter").with_members(["next", "child"])
        }

        async fn invoke(&self, member: &str, _args: Value) -> Result<Value, RemoteError> {
            match member {
                "next" => Ok(Value::Plain(json!(1))),
                "child" => Ok(Value::context(Counter)),
                other => Err(RemoteError::new("NoSuchMember", other)),
            }
        }
    }

    fn counter() -> Arc<dyn Context> {
        Arc::new(Counter)
    }

    #[test]
    fn test_attach_assigns_increasing_ids() {
        let registry = DefinitionRegistry::new(16);
        let a = registry.attach("a", counter()).unwrap();
        let b = registry.attach("b", counter()).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.ctx_id.as_deref(), Some("a"));
        assert!(!a.weak);
        assert_eq!(registry.context_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_attach_fails() {
        let registry = DefinitionRegistry::new(16);
        registry.attach("calc", counter()).unwrap();
        match registry.attach("calc", counter()) {
            Err(NetronError::ContextExists(name)) => assert_eq!(name, "calc"),
            other => panic!("Expected ContextExists, got {other:?}"),
        }
    }

    #[test]
    fn test_detach_unknown_fails() {
        let registry = DefinitionRegistry::new(16);
        match registry.detach("nope") {
            Err(NetronError::UnknownContext(name)) => assert_eq!(name, "nope"),
            other => panic!("Expected UnknownContext, got {other:?}"),
        }
    }

    #[test]
    fn test_subscribers_see_changes_in_order() {
        let registry = DefinitionRegistry::new(16);
        registry.attach("early", counter()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_sub, snapshot) = registry.subscribe(tx);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].ctx_id.as_deref(), Some("early"));

        registry.attach("late", counter()).unwrap();
        registry.detach("early").unwrap();

        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first.kind,
            WireMessageKind::Notification(WireNotification::ContextAttach { ref ctx_id, .. })
                if ctx_id == "late"
        ));
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            second.kind,
            WireMessageKind::Notification(WireNotification::ContextDetach { ref ctx_id, def_id: 1 })
                if ctx_id == "early"
        ));
    }

    #[test]
    fn test_closed_outbox_is_dropped() {
        let registry = DefinitionRegistry::new(16);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.subscribe(tx);
        drop(rx);
        registry.attach("a", counter()).unwrap();
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_weak_definition_reused_per_peer() {
        let registry = DefinitionRegistry::new(16);
        let ctx = counter();
        let first = registry.attach_weak(Arc::clone(&ctx), None, "peer-a");
        let again = registry.attach_weak(Arc::clone(&ctx), None, "peer-a");
        let other = registry.attach_weak(ctx, None, "peer-b");
        assert!(first.weak);
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(registry.issued_to("peer-a"), vec![first.id]);
    }

    #[test]
    fn test_detach_releases_originated() {
        let registry = DefinitionRegistry::new(16);
        let root = registry.attach("root", counter()).unwrap();
        let child = registry.attach_weak(counter(), Some(root.id), "peer-a");
        let grandchild = registry.attach_weak(counter(), Some(child.id), "peer-a");
        let unrelated = registry.attach_weak(counter(), None, "peer-a");

        registry.detach("root").unwrap();
        assert!(registry.definition(child.id).is_none());
        assert!(registry.definition(grandchild.id).is_none());
        assert!(registry.definition(unrelated.id).is_some());
    }

    #[test]
    fn test_release_peer() {
        let registry = DefinitionRegistry::new(16);
        registry.attach("calc", counter()).unwrap();
        registry.attach_weak(counter(), None, "peer-a");
        registry.attach_weak(counter(), None, "peer-b");

        assert_eq!(registry.release_peer("peer-a"), 1);
        assert_eq!(registry.stub_count(), 2);
        assert!(registry.issued_to("peer-a").is_empty());
    }

    #[test]
    fn test_release_rejects_strong() {
        let registry = DefinitionRegistry::new(16);
        let def = registry.attach("calc", counter()).unwrap();
        assert!(matches!(
            registry.release(def.id),
            Err(NetronError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.release(999),
            Err(NetronError::UnknownDefinition(999))
        ));
    }

    #[test]
    fn test_attach_forwarded_own_context() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let own = OwnPeer::new("local", &registry);
        registry.attach("calc", counter()).unwrap();

        let alias = registry
            .attach_forwarded("alias", own.get_interface("calc").unwrap())
            .unwrap();
        assert!(!alias.remote);
        assert!(matches!(
            registry.target(alias.id).unwrap().1,
            StubTarget::Local(_)
        ));
        assert!(own.interfaces().is_empty());

        let taken = registry.attach_forwarded("alias", own.get_interface("calc").unwrap());
        assert!(matches!(taken, Err(NetronError::ContextExists(_))));
        assert!(own.interfaces().is_empty());
    }

    #[test]
    fn test_detach_all() {
        let registry = DefinitionRegistry::new(16);
        registry.attach("a", counter()).unwrap();
        registry.attach("b", counter()).unwrap();
        assert!(registry.has_contexts());
        assert_eq!(registry.detach_all(), vec!["a", "b"]);
        assert!(!registry.has_contexts());
    }

    #[tokio::test]
    async fn test_dispatch_checks_members() {
        let registry = DefinitionRegistry::new(16);
        let def = registry.attach("counter", counter()).unwrap();

        let value = registry
            .dispatch_invoke(def.id, "next", Value::null())
            .await
            .unwrap();
        assert_eq!(value.as_json(), Some(&json!(1)));

        match registry.dispatch_invoke(def.id, "hidden", Value::null()).await {
            Err(NetronError::InvalidArgument(_)) => {}
            other => panic!("Expected InvalidArgument, got {other:?}"),
        }
        match registry.dispatch_invoke(42, "next", Value::null()).await {
            Err(NetronError::UnknownDefinition(42)) => {}
            other => panic!("Expected UnknownDefinition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_events_published() {
        let registry = DefinitionRegistry::new(16);
        let mut attaches = registry.events().on_context_attach();
        registry.attach("calc", counter()).unwrap();
        match attaches.recv().await {
            Some(RemoteEvent::ContextAttach { ctx_id, definition }) => {
                assert_eq!(ctx_id, "calc");
                assert_eq!(definition.id, 1);
            }
            other => panic!("Expected ContextAttach, got {other:?}"),
        }
    }
}
