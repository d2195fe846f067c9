//! In-memory single-process cluster for unit and integration testing.
//!
//! Provides an in-process [`Addressing`] implementation that creates shard
//! actors lazily on first locate, a channel-backed duplex socket, and a
//! small chat-style application, so a gateway plus shards can be driven
//! with no external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::addressing::{ActorHandle, Addressing};
use crate::application::Application;
use crate::config::GatewayConfig;
use crate::envelope::{ClientRequest, Envelope, Reply, RouteMeta};
use crate::error::RoutingError;
use crate::metrics::RoutingMetrics;
use crate::router::GatewayRouter;
use crate::shard::ShardActor;
use crate::socket::{DuplexSocket, SocketEvent, SocketUpgrader};
use crate::types::{ClientId, GatewayId, ShardId};

/// Channel-backed duplex socket that records every sent frame.
pub struct MemorySocket {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemorySocket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Frames delivered to this socket so far.
    pub async fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexSocket for MemorySocket {
    async fn send(&self, frame: &[u8]) -> Result<(), RoutingError> {
        if self.is_closed() {
            return Err(RoutingError::SocketClosed);
        }
        self.sent.lock().await.push(frame.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection handed back by [`LocalCluster::connect`]: the client-side
/// view of one upgraded socket.
pub struct TestConnection {
    pub client: ClientId,
    pub shard: ShardId,
    pub socket: Arc<MemorySocket>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl TestConnection {
    /// Inject an incoming frame, as if the client sent it.
    pub fn send_frame(&self, frame: &[u8]) {
        let _ = self.events.send(SocketEvent::Message(frame.to_vec()));
    }

    /// Close the connection from the client side.
    pub fn close(&self) {
        let _ = self.events.send(SocketEvent::Close);
    }

    /// Fail the connection from the transport side.
    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(SocketEvent::Error(reason.to_string()));
    }
}

/// Upgrader producing [`MemorySocket`]s; hands the pending socket and its
/// event sender back to the test through a queue.
pub struct MemoryUpgrader {
    pending: Mutex<Vec<(Arc<MemorySocket>, mpsc::UnboundedSender<SocketEvent>)>>,
}

impl MemoryUpgrader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
        })
    }

    async fn take_pending(&self) -> Option<(Arc<MemorySocket>, mpsc::UnboundedSender<SocketEvent>)> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }
}

#[async_trait]
impl SocketUpgrader for MemoryUpgrader {
    async fn upgrade(
        &self,
        _request: &ClientRequest,
    ) -> Result<(Arc<dyn DuplexSocket>, mpsc::UnboundedReceiver<SocketEvent>), RoutingError> {
        let socket = MemorySocket::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.push((Arc::clone(&socket), tx));
        Ok((socket, rx))
    }
}

/// In-process actor registry. Shard actors are created lazily on first
/// locate, mirroring create-on-demand addressing in a real host.
pub struct LocalAddressing {
    shards: DashMap<ShardId, Arc<ShardActor>>,
    gateways: DashMap<GatewayId, Arc<GatewayRouter>>,
    next_shard: AtomicU64,
    app: Arc<dyn Application>,
    upgrader: Arc<MemoryUpgrader>,
    metrics: Arc<RoutingMetrics>,
    /// Shard ids that refuse to be located, for failure-path tests.
    unreachable: DashMap<ShardId, ()>,
    /// Back-reference handed to lazily created shard actors.
    self_ref: std::sync::Weak<LocalAddressing>,
}

impl LocalAddressing {
    pub fn new(app: Arc<dyn Application>, upgrader: Arc<MemoryUpgrader>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            shards: DashMap::new(),
            gateways: DashMap::new(),
            next_shard: AtomicU64::new(1),
            app,
            upgrader,
            metrics: Arc::new(RoutingMetrics::unregistered()),
            unreachable: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn register_gateway(&self, router: Arc<GatewayRouter>) {
        self.gateways.insert(router.id().clone(), router);
    }

    /// Direct access to a shard actor, if it has been created.
    pub fn shard(&self, shard: &ShardId) -> Option<Arc<ShardActor>> {
        self.shards.get(shard).map(|entry| Arc::clone(entry.value()))
    }

    /// Make a shard id unlocatable, simulating a dead neighbor.
    pub fn make_unreachable(&self, shard: &ShardId) {
        self.unreachable.insert(shard.clone(), ());
    }

    /// Metrics shared by every shard actor this registry creates.
    pub fn metrics(&self) -> &Arc<RoutingMetrics> {
        &self.metrics
    }
}

struct ShardHandle(Arc<ShardActor>);

#[async_trait]
impl ActorHandle for ShardHandle {
    async fn send(&self, envelope: Envelope) -> Result<Reply, RoutingError> {
        self.0.handle(envelope).await
    }
}

struct GatewayHandle(Arc<GatewayRouter>);

#[async_trait]
impl ActorHandle for GatewayHandle {
    async fn send(&self, envelope: Envelope) -> Result<Reply, RoutingError> {
        self.0.receive(envelope).await
    }
}

#[async_trait]
impl Addressing for LocalAddressing {
    fn create_unique_id(&self) -> ShardId {
        let n = self.next_shard.fetch_add(1, Ordering::SeqCst);
        ShardId::new(format!("shard-{n}"))
    }

    async fn locate_shard(&self, shard: &ShardId) -> Result<Arc<dyn ActorHandle>, RoutingError> {
        if self.unreachable.contains_key(shard) {
            return Err(RoutingError::Addressing {
                reason: format!("shard {shard} unreachable"),
                source: None,
            });
        }
        let actor = self
            .shards
            .entry(shard.clone())
            .or_insert_with(|| {
                let addressing: Arc<dyn Addressing> =
                    self.self_ref.upgrade().expect("registry still alive");
                ShardActor::new(
                    shard.clone(),
                    Arc::clone(&self.app),
                    addressing,
                    Arc::clone(&self.upgrader) as Arc<dyn SocketUpgrader>,
                    Arc::clone(&self.metrics),
                )
            })
            .value()
            .clone();
        Ok(Arc::new(ShardHandle(actor)))
    }

    async fn locate_gateway(
        &self,
        gateway: &GatewayId,
    ) -> Result<Arc<dyn ActorHandle>, RoutingError> {
        let router = self
            .gateways
            .get(gateway)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RoutingError::Addressing {
                reason: format!("gateway {gateway} not registered"),
                source: None,
            })?;
        Ok(Arc::new(GatewayHandle(router)))
    }
}

/// Chat-style application used by the cluster's own tests: identifies
/// clients by the `x-client-id` header, broadcasts every incoming frame,
/// and answers plain requests with an ack.
pub struct ChatApp;

#[async_trait]
impl Application for ChatApp {
    fn identify(&self, request: &ClientRequest) -> Result<ClientId, RoutingError> {
        request
            .header("x-client-id")
            .map(ClientId::new)
            .ok_or(RoutingError::Validation {
                reason: "missing x-client-id header".into(),
            })
    }

    async fn receive(
        &self,
        _shard: &Arc<ShardActor>,
        _meta: &RouteMeta,
        _request: ClientRequest,
    ) -> Result<Reply, RoutingError> {
        Ok(Reply::Response {
            status: 200,
            body: b"ok".to_vec(),
        })
    }

    async fn on_message(
        &self,
        shard: &Arc<ShardActor>,
        client: &ClientId,
        frame: &[u8],
    ) -> Result<(), RoutingError> {
        shard.broadcast(client, frame, false).await;
        Ok(())
    }
}

/// A single-gateway in-memory cluster.
pub struct LocalCluster {
    pub router: Arc<GatewayRouter>,
    pub addressing: Arc<LocalAddressing>,
    upgrader: Arc<MemoryUpgrader>,
}

impl LocalCluster {
    /// Cluster running [`ChatApp`] with the given shard capacity.
    pub fn new(shard_capacity: u32) -> Self {
        Self::with_app(shard_capacity, Arc::new(ChatApp))
    }

    pub fn with_app(shard_capacity: u32, app: Arc<dyn Application>) -> Self {
        let upgrader = MemoryUpgrader::new();
        let addressing = LocalAddressing::new(Arc::clone(&app), Arc::clone(&upgrader));
        let mut config = GatewayConfig::new(GatewayId::new("gateway-1"));
        config.shard_capacity = shard_capacity;
        let router = GatewayRouter::new(
            config,
            app,
            Arc::clone(&addressing) as Arc<dyn Addressing>,
            Arc::new(RoutingMetrics::unregistered()),
        )
        .expect("LocalCluster config should be valid");
        addressing.register_gateway(Arc::clone(&router));
        Self {
            router,
            addressing,
            upgrader,
        }
    }

    /// A well-formed upgrade request for the given client id.
    pub fn handshake_request(client: &str) -> ClientRequest {
        ClientRequest {
            method: "GET".into(),
            headers: HashMap::from([
                ("Upgrade".into(), "websocket".into()),
                ("Connection".into(), "Upgrade".into()),
                // RFC 6455 sample nonce.
                ("Sec-WebSocket-Key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into()),
                ("Sec-WebSocket-Version".into(), "13".into()),
                ("x-client-id".into(), client.into()),
            ]),
            body: vec![],
        }
    }

    /// A plain (non-upgrade) request for the given client id.
    pub fn plain_request(client: &str) -> ClientRequest {
        ClientRequest {
            method: "GET".into(),
            headers: HashMap::from([("x-client-id".into(), client.into())]),
            body: vec![],
        }
    }

    /// Route an upgrade request for `client` and return the established
    /// connection.
    pub async fn connect(&self, client: &str) -> Result<TestConnection, RoutingError> {
        let reply = self
            .router
            .handle(Self::handshake_request(client))
            .await?;
        if !reply.is_upgrade() {
            return Err(RoutingError::Application {
                reason: format!("expected protocol switch, got {reply:?}"),
            });
        }
        let client = ClientId::new(client);
        let shard = self
            .router
            .assignment(&client)
            .await
            .expect("upgraded client has a sticky assignment");
        let (socket, events) = self
            .upgrader
            .take_pending()
            .await
            .expect("upgrade produced a pending socket");
        Ok(TestConnection {
            client,
            shard,
            socket,
            events,
        })
    }

    /// Route a plain request for `client`.
    pub async fn request(&self, client: &str) -> Result<Reply, RoutingError> {
        self.router.handle(Self::plain_request(client)).await
    }

    /// Let detached background work (listeners, introductions, relays)
    /// run to completion.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
