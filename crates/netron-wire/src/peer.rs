//! Peers: the local bookkeeping object for one endpoint.
//!
//! [`Peer`] is the contract every endpoint offers: remote calls by
//! definition id, the definitions the endpoint exposes, interface handles
//! and lifecycle events. [`RemotePeer`] is a connected (or reconnectable)
//! remote node; [`OwnPeer`] is the local node seen through the same API.
//!
//! A `RemotePeer` moves through `Offline -> Connecting -> Online -> Offline`.
//! Going offline rejects every pending request in the same critical section
//! that changes the status. Definitions, interfaces and meta survive, so a
//! reconnect picks up where the last session left off.

use crate::context::Value;
use crate::correlator::RequestCorrelator;
use crate::events::{Delivery, PeerEvents, RemoteEvent};
use crate::forward::{process_args_remote, process_local_result, process_result};
use crate::interface::{Interface, InterfaceTable};
use crate::message::{MetaEntry, WireMessage, WireRequest, WireResponse};
use crate::registry::DefinitionRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use netron_types::{DefId, Definition, NetronConfig, NetronError, NetronResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Offline,
    Connecting,
    Online,
}

/// One endpoint, local or remote.
///
/// Concrete peers must provide the transport operations; the defaults of
/// [`invoke`](Peer::invoke) and [`assign`](Peer::assign) fail with
/// [`NetronError::NotImplemented`].
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    /// Node id of the endpoint.
    fn id(&self) -> &str;

    fn status(&self) -> PeerStatus;

    /// Whether this peer is the local node.
    fn is_local(&self) -> bool {
        false
    }

    /// A shared handle on this peer, used to bind interfaces.
    fn handle(&self) -> Option<Arc<dyn Peer>>;

    /// Any definition known for this peer, strong or weak.
    fn definition(&self, def_id: DefId) -> Option<Definition>;

    /// Strong definition published under `ctx_id`.
    fn definition_by_name(&self, ctx_id: &str) -> Option<Definition>;

    /// Names of the strong contexts, sorted.
    fn context_names(&self) -> Vec<String>;

    fn interfaces(&self) -> &InterfaceTable;

    fn events(&self) -> &PeerEvents;

    /// Call a method or read a property.
    async fn invoke(&self, def_id: DefId, member: &str, args: Value) -> NetronResult<Value> {
        let _ = (def_id, args);
        Err(NetronError::NotImplemented(format!("invoke of '{member}'")))
    }

    /// Write a property or call a method without a result.
    async fn assign(&self, def_id: DefId, member: &str, value: Value) -> NetronResult<()> {
        let _ = (def_id, value);
        Err(NetronError::NotImplemented(format!("assign of '{member}'")))
    }

    /// Call a method with positional arguments.
    async fn call(&self, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.invoke(def_id, method, Value::List(args)).await
    }

    /// Call a method with positional arguments, discarding the result.
    async fn call_void(&self, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.assign(def_id, method, Value::List(args)).await
    }

    fn has_context(&self, ctx_id: &str) -> bool {
        self.definition_by_name(ctx_id).is_some()
    }

    /// Resolve once `ctx_id` is attached on this peer. There is no timeout;
    /// wrap the future to impose one.
    async fn wait_for_context(&self, ctx_id: &str) -> NetronResult<Definition> {
        // Subscribe before checking so an attach in between is not missed.
        let mut attaches = self.events().on_context_attach();
        if let Some(definition) = self.definition_by_name(ctx_id) {
            return Ok(definition);
        }
        loop {
            match attaches.next().await {
                Some(Delivery::Event(RemoteEvent::ContextAttach {
                    ctx_id: name,
                    definition,
                })) if name == ctx_id => return Ok(definition),
                Some(Delivery::Lagged(skipped)) => {
                    debug!(ctx_id, skipped, "Netron: context waiter lagged, rechecking");
                }
                Some(Delivery::Event(_)) => {}
                None => return Err(NetronError::ShuttingDown),
            }
            // The attach may have been among dropped events.
            if let Some(definition) = self.definition_by_name(ctx_id) {
                return Ok(definition);
            }
        }
    }

    /// Interface on the context published under `ctx_id`.
    fn get_interface_by_name(&self, ctx_id: &str) -> NetronResult<Interface> {
        let definition = self
            .definition_by_name(ctx_id)
            .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string()))?;
        bind(self, definition)
    }

    /// Interface on any known definition.
    fn get_interface_by_id(&self, def_id: DefId) -> NetronResult<Interface> {
        let definition = self
            .definition(def_id)
            .ok_or(NetronError::UnknownDefinition(def_id))?;
        bind(self, definition)
    }

    fn get_interface(&self, ctx_id: &str) -> NetronResult<Interface> {
        self.get_interface_by_name(ctx_id)
    }

    /// Drop one handle from this peer's bookkeeping. The definition and
    /// other handles on it are untouched. The handle is consumed even when
    /// it is rejected.
    fn release_interface(&self, iface: Interface) -> NetronResult<()> {
        if iface.peer_id() != self.id() {
            return Err(NetronError::InvalidArgument(format!(
                "Interface belongs to peer {}, not {}",
                iface.peer_id(),
                self.id()
            )));
        }
        if !self.interfaces().contains(iface.def_id()) {
            return Err(NetronError::InvalidArgument(format!(
                "No interface for definition {}",
                iface.def_id()
            )));
        }
        drop(iface);
        Ok(())
    }
}

fn bind<P: Peer + ?Sized>(peer: &P, definition: Definition) -> NetronResult<Interface> {
    let handle = peer.handle().ok_or(NetronError::ShuttingDown)?;
    Ok(Interface::bind(handle, definition))
}

/// Definitions received from a remote peer.
#[derive(Debug, Default)]
struct DefinitionTable {
    by_id: HashMap<DefId, Definition>,
    by_ctx: BTreeMap<String, DefId>,
}

impl DefinitionTable {
    /// Record a strong definition. Returns false if it was already known.
    fn insert_strong(&mut self, ctx_id: &str, definition: Definition) -> bool {
        if let Some(old) = self.by_ctx.insert(ctx_id.to_string(), definition.id) {
            if old == definition.id {
                self.by_id.insert(definition.id, definition);
                return false;
            }
            self.by_id.remove(&old);
        }
        self.by_id.insert(definition.id, definition);
        true
    }

    fn remove_context(&mut self, ctx_id: &str) -> Option<DefId> {
        let id = self.by_ctx.remove(ctx_id)?;
        self.by_id.remove(&id);
        Some(id)
    }

    fn remember(&mut self, definition: &Definition) {
        self.by_id
            .entry(definition.id)
            .or_insert_with(|| definition.clone());
    }
}

/// Everything a session needs that exists only while connected.
pub(crate) struct PeerLink {
    pub node_name: String,
    pub remote_addr: Option<SocketAddr>,
    pub outbox: mpsc::UnboundedSender<WireMessage>,
    pub subscription: u64,
    pub shutdown: watch::Sender<bool>,
}

struct PeerState {
    status: PeerStatus,
    node_name: Option<String>,
    remote_addr: Option<SocketAddr>,
    connected_at: Option<DateTime<Utc>>,
    outbox: Option<mpsc::UnboundedSender<WireMessage>>,
    subscription: Option<u64>,
    shutdown: Option<watch::Sender<bool>>,
    session: u64,
    correlator: RequestCorrelator,
}

/// A remote Netron node.
pub struct RemotePeer {
    id: String,
    this: Weak<RemotePeer>,
    registry: Weak<DefinitionRegistry>,
    response_timeout: Option<Duration>,
    state: Mutex<PeerState>,
    definitions: RwLock<DefinitionTable>,
    interfaces: InterfaceTable,
    meta: RwLock<HashMap<String, serde_json::Value>>,
    events: PeerEvents,
}

impl RemotePeer {
    pub(crate) fn new(
        id: &str,
        registry: &Arc<DefinitionRegistry>,
        config: &NetronConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: id.to_string(),
            this: this.clone(),
            registry: Arc::downgrade(registry),
            response_timeout: config.response_timeout,
            state: Mutex::new(PeerState {
                status: PeerStatus::Offline,
                node_name: None,
                remote_addr: None,
                connected_at: None,
                outbox: None,
                subscription: None,
                shutdown: None,
                session: 0,
                correlator: RequestCorrelator::new(),
            }),
            definitions: RwLock::new(DefinitionTable::default()),
            interfaces: InterfaceTable::new(),
            meta: RwLock::new(HashMap::new()),
            events: PeerEvents::new(config.event_capacity),
        })
    }

    /// Human-readable name announced in the last handshake.
    pub fn node_name(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.node_name.clone()
    }

    /// When the current session came online.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.connected_at
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remote_addr
    }

    /// Ids of the requests awaiting a response.
    pub fn pending_requests(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.correlator.pending_ids()
    }

    /// Ids of every known definition, ascending.
    pub fn definition_ids(&self) -> Vec<DefId> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<DefId> = defs.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn meta(&self, key: &str) -> Option<serde_json::Value> {
        let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
        meta.get(key).cloned()
    }

    pub fn set_meta(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        meta.insert(key.into(), value);
    }

    /// Snapshot of all meta entries.
    pub fn meta_entries(&self) -> HashMap<String, serde_json::Value> {
        let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
        meta.clone()
    }

    /// Ask the peer for metadata entries ("ability", "contexts"). Known
    /// entries are stored in this peer's meta.
    pub async fn request_meta(&self, ids: &[&str]) -> NetronResult<Vec<MetaEntry>> {
        let request = WireRequest::Meta {
            ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        match self.request(request).await? {
            WireResponse::MetaResult { entries } => {
                let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
                for entry in &entries {
                    if let Some(data) = &entry.data {
                        meta.insert(entry.id.clone(), data.clone());
                    }
                }
                Ok(entries)
            }
            WireResponse::Error { error } => Err(NetronError::Remote(error)),
            other => Err(unexpected(&other)),
        }
    }

    /// Round trip to the peer. Returns its uptime in seconds.
    pub async fn ping(&self) -> NetronResult<u64> {
        match self.request(WireRequest::Ping).await? {
            WireResponse::Pong { uptime_secs } => Ok(uptime_secs),
            WireResponse::Error { error } => Err(NetronError::Remote(error)),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the current session. Returns false if the peer was not
    /// connected.
    pub fn disconnect(&self) -> bool {
        let session = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.session
        };
        self.disconnected(session)
    }

    /// Send a request and wait for its response.
    pub(crate) async fn request(&self, request: WireRequest) -> NetronResult<WireResponse> {
        let (request_id, rx) = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            let outbox = match (&state.outbox, state.status) {
                (Some(outbox), PeerStatus::Online) => outbox,
                _ => return Err(NetronError::PeerDisconnected(self.id.clone())),
            };
            let (request_id, rx) = state.correlator.register();
            if outbox
                .send(WireMessage::request(request_id, request))
                .is_err()
            {
                state.correlator.cancel(request_id);
                return Err(NetronError::PeerDisconnected(self.id.clone()));
            }
            (request_id, rx)
        };
        debug!(peer = %self.id, request_id, "Netron: request sent");

        let outcome = match self.response_timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.correlator.cancel(request_id);
                    warn!(peer = %self.id, request_id, "Netron: request timed out");
                    return Err(NetronError::Timeout {
                        peer: self.id.clone(),
                        request_id,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
        };
        // A dropped awaiter means the session ended under us.
        outcome.unwrap_or_else(|_| Err(NetronError::PeerDisconnected(self.id.clone())))
    }

    pub(crate) fn resolve_response(&self, request_id: u64, response: WireResponse) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.correlator.resolve(request_id, response) {
            debug!(peer = %self.id, request_id, "Netron: response for unknown request dropped");
        }
    }

    pub(crate) fn fail_request(&self, request_id: u64, err: NetronError) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.correlator.reject(request_id, err);
    }

    /// Queue a response for the peer. Dropped if the session is gone.
    pub(crate) fn send_response(&self, request_id: u64, response: WireResponse) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = state
            .outbox
            .as_ref()
            .is_some_and(|tx| tx.send(WireMessage::response(request_id, response)).is_ok());
        if !delivered {
            debug!(peer = %self.id, request_id, "Netron: response dropped, peer offline");
        }
    }

    pub(crate) fn begin_connect(&self) -> NetronResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.status {
            PeerStatus::Offline => {
                state.status = PeerStatus::Connecting;
                Ok(())
            }
            _ => Err(NetronError::HandshakeFailed(format!(
                "Peer {} is already connected",
                self.id
            ))),
        }
    }

    pub(crate) fn abort_connect(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status == PeerStatus::Connecting {
            state.status = PeerStatus::Offline;
        }
    }

    /// Enter `Online` with a fresh session. `contexts` is the strong set the
    /// peer announced in the handshake. Returns the session number.
    pub(crate) fn connected(&self, link: PeerLink, contexts: Vec<Definition>) -> u64 {
        let session = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.status = PeerStatus::Online;
            state.node_name = Some(link.node_name.clone());
            state.remote_addr = link.remote_addr;
            state.connected_at = Some(Utc::now());
            state.outbox = Some(link.outbox);
            state.subscription = Some(link.subscription);
            state.shutdown = Some(link.shutdown);
            state.session += 1;
            state.session
        };
        info!(
            peer = %self.id,
            name = %link.node_name,
            session,
            contexts = contexts.len(),
            "Netron: peer online"
        );
        self.events.publish(RemoteEvent::Connected {
            peer_id: self.id.clone(),
        });
        self.sync_contexts(contexts);
        session
    }

    /// Leave `Online` if `session` is still the current one. Every pending
    /// request is rejected with `PeerDisconnected` before the lock is let go.
    pub(crate) fn disconnected(&self, session: u64) -> bool {
        let subscription = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.session != session || state.status == PeerStatus::Offline {
                return false;
            }
            state.status = PeerStatus::Offline;
            state.connected_at = None;
            state.outbox = None;
            if let Some(shutdown) = state.shutdown.take() {
                let _ = shutdown.send(true);
            }
            let id = self.id.clone();
            let rejected = state
                .correlator
                .reject_all(|| NetronError::PeerDisconnected(id.clone()));
            info!(peer = %self.id, session, rejected, "Netron: peer offline");
            state.subscription.take()
        };

        if let Some(registry) = self.registry.upgrade() {
            if let Some(sub_id) = subscription {
                registry.unsubscribe(sub_id);
            }
            registry.release_peer(&self.id);
        }
        self.events.publish(RemoteEvent::Disconnected {
            peer_id: self.id.clone(),
        });
        true
    }

    /// Fold the strong set from a handshake: new contexts are attached,
    /// contexts missing from it are detached.
    fn sync_contexts(&self, contexts: Vec<Definition>) {
        let (detached, attached) = {
            let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
            let current: HashSet<&str> = contexts
                .iter()
                .filter_map(|d| d.ctx_id.as_deref())
                .collect();
            let stale: Vec<String> = defs
                .by_ctx
                .keys()
                .filter(|name| !current.contains(name.as_str()))
                .cloned()
                .collect();
            let detached: Vec<(String, DefId)> = stale
                .into_iter()
                .filter_map(|name| defs.remove_context(&name).map(|id| (name, id)))
                .collect();
            let attached: Vec<(String, Definition)> = contexts
                .into_iter()
                .filter_map(|definition| {
                    let name = definition.ctx_id.clone()?;
                    defs.insert_strong(&name, definition.clone())
                        .then_some((name, definition))
                })
                .collect();
            (detached, attached)
        };
        for (ctx_id, def_id) in detached {
            self.events
                .publish(RemoteEvent::ContextDetach { ctx_id, def_id });
        }
        for (ctx_id, definition) in attached {
            self.events
                .publish(RemoteEvent::ContextAttach { ctx_id, definition });
        }
    }

    pub(crate) fn context_attached(&self, ctx_id: String, definition: Definition) {
        let is_new = {
            let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
            defs.insert_strong(&ctx_id, definition.clone())
        };
        if is_new {
            debug!(peer = %self.id, %ctx_id, def_id = definition.id, "Netron: remote context attached");
            self.events
                .publish(RemoteEvent::ContextAttach { ctx_id, definition });
        }
    }

    pub(crate) fn context_detached(&self, ctx_id: String, def_id: DefId) {
        let removed = {
            let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
            match defs.by_ctx.get(&ctx_id) {
                Some(id) if *id == def_id => defs.remove_context(&ctx_id),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(peer = %self.id, %ctx_id, def_id, "Netron: remote context detached");
            self.events
                .publish(RemoteEvent::ContextDetach { ctx_id, def_id });
        } else {
            warn!(peer = %self.id, %ctx_id, def_id, "Netron: detach for unknown context");
        }
    }

    /// Record a definition received inside a value.
    pub(crate) fn remember_definition(&self, definition: &Definition) {
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        defs.remember(definition);
    }

    pub(crate) fn session(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.session
    }

    fn links(&self) -> NetronResult<(Arc<DefinitionRegistry>, Arc<RemotePeer>)> {
        let registry = self.registry.upgrade().ok_or(NetronError::ShuttingDown)?;
        let this = self.this.upgrade().ok_or(NetronError::ShuttingDown)?;
        Ok((registry, this))
    }

    fn require_definition(&self, def_id: DefId) -> NetronResult<()> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        if defs.by_id.contains_key(&def_id) {
            Ok(())
        } else {
            Err(NetronError::UnknownDefinition(def_id))
        }
    }
}

#[async_trait]
impl Peer for RemotePeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> PeerStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.status
    }

    fn handle(&self) -> Option<Arc<dyn Peer>> {
        self.this.upgrade().map(|p| p as Arc<dyn Peer>)
    }

    fn definition(&self, def_id: DefId) -> Option<Definition> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_id.get(&def_id).cloned()
    }

    fn definition_by_name(&self, ctx_id: &str) -> Option<Definition> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_ctx
            .get(ctx_id)
            .and_then(|id| defs.by_id.get(id))
            .cloned()
    }

    fn context_names(&self) -> Vec<String> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.by_ctx.keys().cloned().collect()
    }

    fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    fn events(&self) -> &PeerEvents {
        &self.events
    }

    async fn invoke(&self, def_id: DefId, member: &str, args: Value) -> NetronResult<Value> {
        self.require_definition(def_id)?;
        let (registry, this) = self.links()?;
        let payload = process_args_remote(&registry, &self.id, args, None)?;
        let request = WireRequest::Invoke {
            def_id,
            member: member.to_string(),
            payload,
        };
        match self.request(request).await? {
            WireResponse::Result { value } => process_result(&registry, &this, value),
            WireResponse::Error { error } => Err(NetronError::Remote(error)),
            other => Err(unexpected(&other)),
        }
    }

    async fn assign(&self, def_id: DefId, member: &str, value: Value) -> NetronResult<()> {
        self.require_definition(def_id)?;
        let (registry, _) = self.links()?;
        let payload = process_args_remote(&registry, &self.id, value, None)?;
        let request = WireRequest::Assign {
            def_id,
            member: member.to_string(),
            payload,
        };
        match self.request(request).await? {
            WireResponse::Done => Ok(()),
            WireResponse::Error { error } => Err(NetronError::Remote(error)),
            other => Err(unexpected(&other)),
        }
    }
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("contexts", &self.context_names())
            .finish()
    }
}

fn unexpected(response: &WireResponse) -> NetronError {
    NetronError::Transport(format!("Unexpected response: {response:?}"))
}

/// The local node seen as a peer. Calls dispatch straight to the local
/// registry; objects returned by reference get weak definitions like they
/// would for a remote caller.
pub struct OwnPeer {
    id: String,
    this: Weak<OwnPeer>,
    registry: Weak<DefinitionRegistry>,
    interfaces: InterfaceTable,
    events: PeerEvents,
}

impl OwnPeer {
    pub(crate) fn new(id: &str, registry: &Arc<DefinitionRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: id.to_string(),
            this: this.clone(),
            registry: Arc::downgrade(registry),
            interfaces: InterfaceTable::new(),
            events: registry.events().clone(),
        })
    }

    fn registry(&self) -> NetronResult<Arc<DefinitionRegistry>> {
        self.registry.upgrade().ok_or(NetronError::ShuttingDown)
    }
}

#[async_trait]
impl Peer for OwnPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> PeerStatus {
        PeerStatus::Online
    }

    fn is_local(&self) -> bool {
        true
    }

    fn handle(&self) -> Option<Arc<dyn Peer>> {
        self.this.upgrade().map(|p| p as Arc<dyn Peer>)
    }

    fn definition(&self, def_id: DefId) -> Option<Definition> {
        self.registry.upgrade()?.definition(def_id)
    }

    fn definition_by_name(&self, ctx_id: &str) -> Option<Definition> {
        self.registry.upgrade()?.context_definition(ctx_id)
    }

    fn context_names(&self) -> Vec<String> {
        self.registry
            .upgrade()
            .map(|r| r.context_names())
            .unwrap_or_default()
    }

    fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    fn events(&self) -> &PeerEvents {
        &self.events
    }

    async fn invoke(&self, def_id: DefId, member: &str, args: Value) -> NetronResult<Value> {
        let registry = self.registry()?;
        let own = self.handle().ok_or(NetronError::ShuttingDown)?;
        let value = registry.dispatch_invoke(def_id, member, args).await?;
        Ok(process_local_result(&registry, &own, value, Some(def_id)))
    }

    async fn assign(&self, def_id: DefId, member: &str, value: Value) -> NetronResult<()> {
        self.registry()?.dispatch_assign(def_id, member, value).await
    }
}

impl fmt::Debug for OwnPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnPeer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use netron_types::{ContextDescriptor, RemoteError};
    use serde_json::json;

    struct Calculator;

    #[async_trait]
    impl Context for Calculator {
        fn descriptor(&self) -> ContextDescriptor {
            ContextDescriptor::new("Calculator").with_members(["add", "spawn"])
        }

        async fn invoke(&self, member: &str, args: Value) -> Result<Value, RemoteError> {
            match member {
                "add" => {
                    let sum: i64 = args
                        .into_args()
                        .iter()
                        .filter_map(|a| a.as_json().and_then(|v| v.as_i64()))
                        .sum();
                    Ok(Value::Plain(json!(sum)))
                }
                "spawn" => Ok(Value::context(Calculator)),
                other => Err(RemoteError::new("NoSuchMember", other)),
            }
        }
    }

    /// A peer providing only the bookkeeping, no transport.
    struct BarePeer {
        interfaces: InterfaceTable,
        events: PeerEvents,
    }

    #[async_trait]
    impl Peer for BarePeer {
        fn id(&self) -> &str {
            "bare"
        }
        fn status(&self) -> PeerStatus {
            PeerStatus::Offline
        }
        fn handle(&self) -> Option<Arc<dyn Peer>> {
            None
        }
        fn definition(&self, _def_id: DefId) -> Option<Definition> {
            None
        }
        fn definition_by_name(&self, _ctx_id: &str) -> Option<Definition> {
            None
        }
        fn context_names(&self) -> Vec<String> {
            Vec::new()
        }
        fn interfaces(&self) -> &InterfaceTable {
            &self.interfaces
        }
        fn events(&self) -> &PeerEvents {
            &self.events
        }
    }

    fn bare() -> BarePeer {
        BarePeer {
            interfaces: InterfaceTable::new(),
            events: PeerEvents::new(4),
        }
    }

    fn link(outbox: mpsc::UnboundedSender<WireMessage>) -> PeerLink {
        let (shutdown, _) = watch::channel(false);
        PeerLink {
            node_name: "remote".to_string(),
            remote_addr: None,
            outbox,
            subscription: 0,
            shutdown,
        }
    }

    fn calc_def(id: DefId) -> Definition {
        Definition::strong(
            id,
            "calc",
            &ContextDescriptor::new("Calculator").with_members(["add"]),
        )
    }

    #[tokio::test]
    async fn test_bare_peer_not_implemented() {
        let peer = bare();
        match peer.invoke(1, "add", Value::null()).await {
            Err(NetronError::NotImplemented(_)) => {}
            other => panic!("Expected NotImplemented, got {other:?}"),
        }
        match peer.call_void(1, "add", vec![]).await {
            Err(NetronError::NotImplemented(_)) => {}
            other => panic!("Expected NotImplemented, got {other:?}"),
        }
        assert!(matches!(
            peer.get_interface("calc"),
            Err(NetronError::UnknownContext(_))
        ));
        assert!(matches!(
            peer.get_interface_by_id(3),
            Err(NetronError::UnknownDefinition(3))
        ));
    }

    #[tokio::test]
    async fn test_offline_peer_rejects_requests() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        assert_eq!(peer.status(), PeerStatus::Offline);
        match peer.ping().await {
            Err(NetronError::PeerDisconnected(id)) => assert_eq!(id, "node-b"),
            other => panic!("Expected PeerDisconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_definition_checked_locally() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        match peer.invoke(100500, "add", Value::null()).await {
            Err(NetronError::UnknownDefinition(100500)) => {}
            other => panic!("Expected UnknownDefinition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_keeps_state() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.begin_connect().unwrap();
        let session = peer.connected(link(tx), vec![calc_def(1)]);
        peer.set_meta("ability", json!({"node_name": "remote"}));

        let mut calls = Vec::new();
        for _ in 0..3 {
            let p = Arc::clone(&peer);
            calls.push(tokio::spawn(async move {
                p.call(1, "add", vec![Value::Plain(json!(2)), Value::Plain(json!(3))])
                    .await
            }));
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert_eq!(peer.pending_requests(), vec![1, 2, 3]);

        assert!(peer.disconnected(session));
        assert!(!peer.disconnected(session));
        for call in calls {
            match call.await.unwrap() {
                Err(NetronError::PeerDisconnected(id)) => assert_eq!(id, "node-b"),
                other => panic!("Expected PeerDisconnected, got {other:?}"),
            }
        }
        assert!(peer.pending_requests().is_empty());
        assert_eq!(peer.status(), PeerStatus::Offline);
        assert!(peer.has_context("calc"));
        assert_eq!(peer.definition_ids(), vec![1]);
        assert!(peer.meta("ability").is_some());
    }

    #[tokio::test]
    async fn test_response_resolves_call() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.begin_connect().unwrap();
        peer.connected(link(tx), vec![calc_def(1)]);

        let p = Arc::clone(&peer);
        let call = tokio::spawn(async move {
            p.call(1, "add", vec![Value::Plain(json!(2)), Value::Plain(json!(3))])
                .await
        });
        let sent = rx.recv().await.unwrap();
        peer.resolve_response(
            sent.id,
            WireResponse::Result {
                value: json!(5).into(),
            },
        );
        let value = call.await.unwrap().unwrap();
        assert_eq!(value.as_json(), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_timeout_removes_awaiter() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let config = NetronConfig {
            response_timeout: Some(Duration::from_millis(20)),
            ..NetronConfig::default()
        };
        let peer = RemotePeer::new("node-b", &registry, &config);
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.begin_connect().unwrap();
        peer.connected(link(tx), vec![]);

        match peer.ping().await {
            Err(NetronError::Timeout {
                request_id,
                timeout_ms,
                ..
            }) => {
                assert_eq!(request_id, 1);
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(peer.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_context_events_fold_into_definitions() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        let mut attaches = peer.events().on_context_attach();
        let mut detaches = peer.events().on_context_detach();

        peer.context_attached("calc".to_string(), calc_def(4));
        assert!(peer.has_context("calc"));
        assert!(matches!(
            attaches.recv().await,
            Some(RemoteEvent::ContextAttach { .. })
        ));

        peer.context_detached("calc".to_string(), 4);
        assert!(!peer.has_context("calc"));
        assert!(peer.definition(4).is_none());
        assert!(matches!(
            detaches.recv().await,
            Some(RemoteEvent::ContextDetach { def_id: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_context() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());

        let p = Arc::clone(&peer);
        let waiter = tokio::spawn(async move { p.wait_for_context("calc").await });
        tokio::task::yield_now().await;
        peer.context_attached("other".to_string(), {
            let mut def = calc_def(2);
            def.ctx_id = Some("other".to_string());
            def
        });
        peer.context_attached("calc".to_string(), calc_def(3));

        let definition = waiter.await.unwrap().unwrap();
        assert_eq!(definition.id, 3);
        // Already present: resolves immediately.
        assert_eq!(peer.wait_for_context("calc").await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_wait_for_context_survives_lag() {
        let registry = Arc::new(DefinitionRegistry::new(1));
        let own = OwnPeer::new("local", &registry);

        let mut waiter = tokio_test::task::spawn(own.wait_for_context("calc"));
        tokio_test::assert_pending!(waiter.poll());

        // Three attaches overflow the one-slot channel before the waiter runs.
        let calc = registry.attach("calc", Arc::new(Calculator)).unwrap();
        registry.attach("a", Arc::new(Calculator)).unwrap();
        registry.attach("b", Arc::new(Calculator)).unwrap();

        assert!(waiter.is_woken());
        let definition = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(definition.id, calc.id);
    }

    #[tokio::test]
    async fn test_dropped_interfaces_leave_no_entries() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        peer.context_attached("calc".to_string(), calc_def(1));

        let handles: Vec<Interface> = (0..100)
            .map(|_| peer.get_interface_by_id(1).unwrap())
            .collect();
        let copy = handles[0].clone();
        assert_eq!(peer.interfaces().handles(1), 101);

        drop(handles);
        assert_eq!(peer.interfaces().handles(1), 1);
        drop(copy);
        assert!(peer.interfaces().is_empty());
        assert_eq!(peer.definition_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_interface_release_keeps_definition() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let peer = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        peer.context_attached("calc".to_string(), calc_def(1));

        let iface = peer.get_interface_by_id(1).unwrap();
        assert_eq!(peer.interfaces().len(), 1);
        peer.release_interface(iface).unwrap();
        assert!(peer.interfaces().is_empty());
        assert_eq!(peer.definition_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_release_foreign_interface_rejected() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let a = RemotePeer::new("node-a", &registry, &NetronConfig::default());
        let b = RemotePeer::new("node-b", &registry, &NetronConfig::default());
        a.context_attached("calc".to_string(), calc_def(1));

        let iface = a.get_interface("calc").unwrap();
        match b.release_interface(iface) {
            Err(NetronError::InvalidArgument(_)) => {}
            other => panic!("Expected InvalidArgument, got {other:?}"),
        }
        // The rejected handle is still given back to its own peer.
        assert!(a.interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_own_peer_dispatches_locally() {
        let registry = Arc::new(DefinitionRegistry::new(16));
        let def = registry.attach("calc", Arc::new(Calculator)).unwrap();
        let own = OwnPeer::new("local", &registry);

        let calc = own.get_interface("calc").unwrap();
        let sum = calc
            .call("add", vec![Value::Plain(json!(2)), Value::Plain(json!(3))])
            .await
            .unwrap();
        assert_eq!(sum.as_json(), Some(&json!(5)));

        let child = calc.call("spawn", vec![]).await.unwrap().into_interface().unwrap();
        assert!(child.definition().weak);
        assert_eq!(child.definition().parent_id, Some(def.id));
        assert_eq!(child.peer_id(), "local");
    }
}
