//! Netron: the local node owning the definition registry and its peers.
//!
//! A [`Netron`] exposes local contexts and talks to any number of peers.
//! Each connection performs a handshake that exchanges identity and the full
//! set of strong definitions, then runs two tasks: a writer draining the
//! peer's outbox into the transport, and a dispatch loop that folds context
//! notifications in arrival order, resolves responses and serves requests.

use crate::context::Context;
use crate::forward::{process_args_remote, process_result};
use crate::interface::Interface;
use crate::message::*;
use crate::peer::{OwnPeer, Peer, PeerLink, RemotePeer};
use crate::peers::PeerRegistry;
use crate::registry::DefinitionRegistry;
use crate::transport::{Connection, MessageSink, MessageSource, WireError};
use netron_types::{
    DefId, Definition, NetronConfig, NetronError, NetronResult, RemoteError, WireValue,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

struct NetronInner {
    config: NetronConfig,
    registry: Arc<DefinitionRegistry>,
    peers: PeerRegistry,
    own_peer: Arc<OwnPeer>,
    start_time: Instant,
}

/// A local Netron node. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Netron {
    inner: Arc<NetronInner>,
}

/// Identity announced by the other side of a handshake.
struct RemoteHello {
    node_id: String,
    node_name: String,
    contexts: Vec<Definition>,
}

impl Netron {
    /// Create a node with no contexts and no peers.
    pub fn new(config: NetronConfig) -> Self {
        let registry = Arc::new(DefinitionRegistry::new(config.event_capacity));
        let own_peer = OwnPeer::new(&config.node_id, &registry);
        Self {
            inner: Arc::new(NetronInner {
                config,
                registry,
                peers: PeerRegistry::new(),
                own_peer,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &NetronConfig {
        &self.inner.config
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.inner.registry
    }

    /// Get a reference to the peer table.
    pub fn peer_registry(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    /// This node seen as a peer.
    pub fn own_peer(&self) -> Arc<dyn Peer> {
        Arc::clone(&self.inner.own_peer) as Arc<dyn Peer>
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Attach a context under `ctx_id` and announce it to every peer.
    pub fn attach_context(&self, ctx_id: &str, ctx: Arc<dyn Context>) -> NetronResult<Definition> {
        self.inner.registry.attach(ctx_id, ctx)
    }

    /// Attach a context under its class name.
    pub fn attach_default_context(&self, ctx: Arc<dyn Context>) -> NetronResult<Definition> {
        let ctx_id = ctx.descriptor().name;
        self.inner.registry.attach(&ctx_id, ctx)
    }

    /// Publish an interface on another peer as a context of this node.
    pub fn attach_forwarded(&self, ctx_id: &str, iface: Interface) -> NetronResult<Definition> {
        self.inner.registry.attach_forwarded(ctx_id, iface)
    }

    pub fn detach_context(&self, ctx_id: &str) -> NetronResult<Definition> {
        self.inner.registry.detach(ctx_id)
    }

    pub fn detach_all_contexts(&self) -> Vec<String> {
        self.inner.registry.detach_all()
    }

    pub fn context_names(&self) -> Vec<String> {
        self.inner.registry.context_names()
    }

    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.inner.registry.has_context(ctx_id)
    }

    pub fn has_contexts(&self) -> bool {
        self.inner.registry.has_contexts()
    }

    /// Look up a known peer.
    pub fn peer(&self, node_id: &str) -> NetronResult<Arc<RemotePeer>> {
        self.inner
            .peers
            .get_peer(node_id)
            .ok_or_else(|| NetronError::UnknownPeer(node_id.to_string()))
    }

    /// All known peers, online or not.
    pub fn peers(&self) -> Vec<Arc<RemotePeer>> {
        self.inner.peers.all_peers()
    }

    /// Close the session with one peer.
    pub fn disconnect_peer(&self, node_id: &str) -> NetronResult<()> {
        let peer = self.peer(node_id)?;
        if !peer.disconnect() {
            debug!("Netron: peer {} was not connected", node_id);
        }
        Ok(())
    }

    /// Close every session.
    pub fn disconnect_all(&self) {
        for peer in self.inner.peers.online_peers() {
            peer.disconnect();
        }
    }

    /// Dial a peer over TCP and perform the handshake.
    pub async fn connect_tcp(&self, addr: SocketAddr) -> NetronResult<Arc<RemotePeer>> {
        info!("Netron: connecting to peer at {}", addr);
        let stream = TcpStream::connect(addr).await?;
        self.connect(Connection::tcp(stream, self.inner.config.max_message_size))
            .await
    }

    /// Bind the configured listen address and accept peers in a spawned
    /// task. Returns the bound address and the accept task.
    pub async fn listen(&self) -> NetronResult<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Netron: listening on {} (node_id={})",
            local_addr,
            self.node_id()
        );

        let node = self.clone();
        let accept_handle = tokio::spawn(async move {
            node.accept_loop(listener).await;
        });
        Ok((local_addr, accept_handle))
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Netron: accepted connection from {}", addr);
                    let node = self.clone();
                    let conn = Connection::tcp(stream, self.inner.config.max_message_size);
                    tokio::spawn(async move {
                        if let Err(e) = node.accept(conn).await {
                            debug!("Netron: inbound connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Netron: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Perform the dialing side of the handshake on `conn`.
    pub async fn connect(&self, conn: Connection) -> NetronResult<Arc<RemotePeer>> {
        let remote_addr = conn.remote_addr();
        let (mut sink, mut source) = conn.into_parts();

        // Subscribe first: the snapshot and the outbox cover every change.
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (subscription, contexts) = self.inner.registry.subscribe(outbox.clone());

        let hello = self.handshake(&mut *sink, &mut *source, contexts).await;
        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                self.inner.registry.unsubscribe(subscription);
                return Err(e.into());
            }
        };

        let peer = self.peer_for(&hello.node_id);
        if let Err(e) = peer.begin_connect() {
            self.inner.registry.unsubscribe(subscription);
            return Err(e);
        }
        info!(
            "Netron: handshake complete with {} ({}), {} contexts",
            hello.node_name,
            hello.node_id,
            hello.contexts.len()
        );
        Ok(self.establish(
            peer,
            hello,
            remote_addr,
            Session {
                sink,
                source,
                outbox,
                outbox_rx,
                subscription,
            },
        ))
    }

    async fn handshake(
        &self,
        sink: &mut dyn MessageSink,
        source: &mut dyn MessageSource,
        contexts: Vec<Definition>,
    ) -> Result<RemoteHello, WireError> {
        let handshake = WireMessage::request(
            UNCORRELATED,
            WireRequest::Handshake {
                node_id: self.inner.config.node_id.clone(),
                node_name: self.inner.config.node_name.clone(),
                protocol_version: PROTOCOL_VERSION,
                contexts,
            },
        );
        sink.send(&handshake).await?;

        let response = source.recv().await?;
        match response.kind {
            WireMessageKind::Response(WireResponse::HandshakeAck {
                node_id,
                node_name,
                protocol_version,
                contexts,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                Ok(RemoteHello {
                    node_id,
                    node_name,
                    contexts,
                })
            }
            WireMessageKind::Response(WireResponse::Error { error }) => Err(
                WireError::HandshakeFailed(format!("Remote error {}", error)),
            ),
            _ => Err(WireError::HandshakeFailed(
                "Unexpected response to handshake".to_string(),
            )),
        }
    }

    /// Perform the accepting side of the handshake on `conn`.
    pub async fn accept(&self, conn: Connection) -> NetronResult<Arc<RemotePeer>> {
        let remote_addr = conn.remote_addr();
        let (mut sink, mut source) = conn.into_parts();

        let msg = source.recv().await.map_err(NetronError::from)?;
        let hello = match msg.kind {
            WireMessageKind::Request(WireRequest::Handshake {
                node_id,
                node_name,
                protocol_version,
                contexts,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let err = WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    };
                    reject(&mut *sink, msg.id, "HandshakeFailed", &err.to_string()).await;
                    return Err(err.into());
                }
                RemoteHello {
                    node_id,
                    node_name,
                    contexts,
                }
            }
            _ => {
                warn!(
                    "Netron: rejected message before handshake from {:?}",
                    remote_addr
                );
                reject(&mut *sink, msg.id, "HandshakeFailed", "Handshake required").await;
                return Err(NetronError::HandshakeFailed(
                    "Peer sent a request before the handshake".into(),
                ));
            }
        };

        let peer = self.peer_for(&hello.node_id);
        if let Err(e) = peer.begin_connect() {
            reject(&mut *sink, msg.id, "HandshakeFailed", &e.to_string()).await;
            return Err(e);
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (subscription, contexts) = self.inner.registry.subscribe(outbox.clone());
        let ack = WireMessage::response(
            msg.id,
            WireResponse::HandshakeAck {
                node_id: self.inner.config.node_id.clone(),
                node_name: self.inner.config.node_name.clone(),
                protocol_version: PROTOCOL_VERSION,
                contexts,
            },
        );
        if let Err(e) = sink.send(&ack).await {
            self.inner.registry.unsubscribe(subscription);
            peer.abort_connect();
            return Err(e.into());
        }

        info!(
            "Netron: handshake with {} ({}) from {:?}, {} contexts",
            hello.node_name,
            hello.node_id,
            remote_addr,
            hello.contexts.len()
        );
        Ok(self.establish(
            peer,
            hello,
            remote_addr,
            Session {
                sink,
                source,
                outbox,
                outbox_rx,
                subscription,
            },
        ))
    }

    fn peer_for(&self, node_id: &str) -> Arc<RemotePeer> {
        let registry = &self.inner.registry;
        let config = &self.inner.config;
        self.inner
            .peers
            .get_or_create(node_id, || RemotePeer::new(node_id, registry, config))
    }

    /// Bring `peer` online and spawn the writer and dispatch tasks.
    fn establish(
        &self,
        peer: Arc<RemotePeer>,
        hello: RemoteHello,
        remote_addr: Option<SocketAddr>,
        session: Session,
    ) -> Arc<RemotePeer> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session_id = peer.connected(
            PeerLink {
                node_name: hello.node_name,
                remote_addr,
                outbox: session.outbox,
                subscription: session.subscription,
                shutdown: shutdown_tx,
            },
            hello.contexts,
        );

        tokio::spawn(writer_loop(
            session.sink,
            session.outbox_rx,
            Arc::clone(&peer),
            session_id,
            shutdown_rx.clone(),
        ));
        let node = self.clone();
        let dispatch_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            node.connection_loop(session.source, dispatch_peer, session_id, shutdown_rx)
                .await;
        });
        peer
    }

    /// Read/dispatch loop for an established session.
    async fn connection_loop(
        self,
        mut source: Box<dyn MessageSource>,
        peer: Arc<RemotePeer>,
        session: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let received = tokio::select! {
                received = source.recv() => received,
                _ = shutdown.changed() => break,
            };
            match received {
                Ok(msg) => {
                    if !self.dispatch(&peer, msg) {
                        break;
                    }
                }
                Err(WireError::Json(e)) => {
                    warn!("Netron: dropped undecodable frame from {}: {}", peer.id(), e);
                }
                Err(WireError::Undecodable {
                    id,
                    frame_type,
                    reason,
                }) => {
                    warn!(
                        "Netron: dropped undecodable {:?} frame {:?} from {}: {}",
                        frame_type,
                        id,
                        peer.id(),
                        reason
                    );
                    // Settle the exchange the frame belonged to.
                    match (frame_type.as_deref(), id) {
                        (Some("response"), Some(id)) => {
                            peer.fail_request(id, NetronError::Serialization(reason));
                        }
                        (Some("request"), Some(id)) if id != UNCORRELATED => {
                            let error = RemoteError::from(NetronError::Serialization(reason));
                            peer.send_response(id, WireResponse::Error { error });
                        }
                        _ => {}
                    }
                }
                Err(WireError::ConnectionClosed) => {
                    debug!("Netron: connection to {} closed", peer.id());
                    break;
                }
                Err(e) => {
                    debug!("Netron: connection to {} ended: {}", peer.id(), e);
                    break;
                }
            }
        }
        peer.disconnected(session);
    }

    /// Route one incoming message. Returns false when the session should end.
    fn dispatch(&self, peer: &Arc<RemotePeer>, msg: WireMessage) -> bool {
        match msg.kind {
            // Folded inline so listeners see them in wire order.
            WireMessageKind::Notification(notification) => match notification {
                WireNotification::ContextAttach { ctx_id, definition } => {
                    peer.context_attached(ctx_id, definition);
                }
                WireNotification::ContextDetach { ctx_id, def_id } => {
                    peer.context_detached(ctx_id, def_id);
                }
                WireNotification::ShuttingDown => {
                    info!("Netron: peer {} is shutting down", peer.id());
                    return false;
                }
            },
            WireMessageKind::Response(response) => {
                peer.resolve_response(msg.id, response);
            }
            WireMessageKind::Request(request) => {
                let node = self.clone();
                let peer = Arc::clone(peer);
                let request_id = msg.id;
                tokio::spawn(async move {
                    let response = node.handle_request(&peer, request).await;
                    peer.send_response(request_id, response);
                });
            }
        }
        true
    }

    async fn handle_request(&self, peer: &Arc<RemotePeer>, request: WireRequest) -> WireResponse {
        let outcome = match request {
            WireRequest::Invoke {
                def_id,
                member,
                payload,
            } => self.serve_invoke(peer, def_id, &member, payload).await,
            WireRequest::Assign {
                def_id,
                member,
                payload,
            } => self.serve_assign(peer, def_id, &member, payload).await,
            WireRequest::Meta { ids } => Ok(WireResponse::MetaResult {
                entries: ids.into_iter().map(|id| self.meta_entry(id)).collect(),
            }),
            WireRequest::Ping => Ok(WireResponse::Pong {
                uptime_secs: self.uptime_secs(),
            }),
            WireRequest::Handshake { .. } => {
                Err(NetronError::HandshakeFailed("Already handshaked".to_string()))
            }
        };
        outcome.unwrap_or_else(|e| {
            debug!("Netron: request from {} failed: {}", peer.id(), e);
            WireResponse::Error { error: e.into() }
        })
    }

    async fn serve_invoke(
        &self,
        peer: &Arc<RemotePeer>,
        def_id: DefId,
        member: &str,
        payload: WireValue,
    ) -> NetronResult<WireResponse> {
        let registry = &self.inner.registry;
        debug!(peer = %peer.id(), def_id, member, "Netron: serving invoke");
        let args = process_result(registry, peer, payload)?;
        let value = registry.dispatch_invoke(def_id, member, args).await?;
        // Objects in the result are produced through `def_id`.
        let value = process_args_remote(registry, peer.id(), value, Some(def_id))?;
        Ok(WireResponse::Result { value })
    }

    async fn serve_assign(
        &self,
        peer: &Arc<RemotePeer>,
        def_id: DefId,
        member: &str,
        payload: WireValue,
    ) -> NetronResult<WireResponse> {
        let registry = &self.inner.registry;
        debug!(peer = %peer.id(), def_id, member, "Netron: serving assign");
        let value = process_result(registry, peer, payload)?;
        registry.dispatch_assign(def_id, member, value).await?;
        Ok(WireResponse::Done)
    }

    fn meta_entry(&self, id: String) -> MetaEntry {
        let data = match id.as_str() {
            "ability" => serde_json::to_value(&self.inner.config).map_err(NetronError::from),
            "contexts" => {
                let contexts: BTreeMap<String, Definition> = self
                    .inner
                    .registry
                    .strong_definitions()
                    .into_iter()
                    .filter_map(|d| d.ctx_id.clone().map(|name| (name, d)))
                    .collect();
                serde_json::to_value(contexts).map_err(NetronError::from)
            }
            other => Err(NetronError::InvalidArgument(format!(
                "Unknown meta id: {other}"
            ))),
        };
        match data {
            Ok(data) => MetaEntry {
                id,
                data: Some(data),
                error: None,
            },
            Err(e) => MetaEntry {
                id,
                data: None,
                error: Some(e.into()),
            },
        }
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("node_id", &self.node_id())
            .field("contexts", &self.context_names())
            .field("peers", &self.inner.peers.total_count())
            .finish()
    }
}

/// Transport halves and outbox of a session being established.
struct Session {
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
    outbox: mpsc::UnboundedSender<WireMessage>,
    outbox_rx: mpsc::UnboundedReceiver<WireMessage>,
    subscription: u64,
}

/// Answer a failed handshake before dropping the connection.
async fn reject(sink: &mut dyn MessageSink, id: u64, kind: &str, message: &str) {
    let response = WireMessage::response(
        id,
        WireResponse::Error {
            error: RemoteError::new(kind, message),
        },
    );
    if let Err(e) = sink.send(&response).await {
        debug!("Netron: failed to send handshake rejection: {}", e);
    }
}

/// Drain a peer's outbox into the transport.
///
/// A message that cannot be sent fails only the request it belongs to;
/// the session ends on I/O errors.
async fn writer_loop(
    mut sink: Box<dyn MessageSink>,
    mut outbox: mpsc::UnboundedReceiver<WireMessage>,
    peer: Arc<RemotePeer>,
    session: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            msg = outbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = shutdown.changed() => {
                let bye = WireMessage::notification(WireNotification::ShuttingDown);
                let _ = sink.send(&bye).await;
                break;
            }
        };

        let Err(e) = sink.send(&msg).await else {
            continue;
        };
        let fatal = matches!(e, WireError::Io(_) | WireError::ConnectionClosed);
        warn!("Netron: failed to send message {} to {}: {}", msg.id, peer.id(), e);
        let err = NetronError::from(e);
        match msg.kind {
            WireMessageKind::Request(_) => peer.fail_request(msg.id, err),
            WireMessageKind::Response(WireResponse::Error { .. }) => {}
            WireMessageKind::Response(_) if !fatal => {
                // Tell the caller its answer could not be delivered.
                let reply = WireMessage::response(
                    msg.id,
                    WireResponse::Error {
                        error: RemoteError::from(err),
                    },
                );
                let _ = sink.send(&reply).await;
            }
            _ => {}
        }
        if fatal {
            peer.disconnected(session);
            break;
        }
    }
}
