use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::addressing::Addressing;
use crate::application::Application;
use crate::envelope::{
    BroadcastRelay, CloseNotice, Envelope, Reply, RequestEnvelope, RouteMeta, WhisperRelay,
};
use crate::error::RoutingError;
use crate::metrics::RoutingMetrics;
use crate::pool::{ConnectionPool, PoolEntry};
use crate::socket::{SocketEvent, SocketUpgrader};
use crate::types::{ClientId, GatewayId, ShardId};
use crate::upgrade;

/// Hosting tier: holds live duplex connections for one shard, fans
/// messages out locally, relays to neighbor shards, and reports connection
/// lifecycle back to the gateway.
pub struct ShardActor {
    id: ShardId,
    app: Arc<dyn Application>,
    addressing: Arc<dyn Addressing>,
    upgrader: Arc<dyn SocketUpgrader>,
    metrics: Arc<RoutingMetrics>,
    state: Mutex<ShardState>,
}

#[derive(Default)]
struct ShardState {
    pool: ConnectionPool,
    /// Shards this one may relay to. Grow-only; re-introduction is a no-op.
    neighbors: HashSet<ShardId>,
}

impl ShardActor {
    pub fn new(
        id: ShardId,
        app: Arc<dyn Application>,
        addressing: Arc<dyn Addressing>,
        upgrader: Arc<dyn SocketUpgrader>,
        metrics: Arc<RoutingMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            app,
            addressing,
            upgrader,
            metrics,
            state: Mutex::new(ShardState::default()),
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Inbound envelope dispatch.
    ///
    /// Client traffic goes through the upgrade or application path; control
    /// envelopes are handled internally and answered with an empty ack.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Result<Reply, RoutingError> {
        match envelope {
            Envelope::Request(env) => self.handle_request(env).await,
            Envelope::Neighbor(intro) => {
                let mut state = self.state.lock().await;
                // Idempotent: a known neighbor leaves the set unchanged.
                if state.neighbors.insert(intro.neighbor.clone()) {
                    debug!(shard = %self.id, neighbor = %intro.neighbor, "neighbor introduced");
                }
                Ok(Reply::Ack)
            }
            Envelope::Broadcast(BroadcastRelay { sender, message }) => {
                // Local emit only; relays are never re-relayed.
                self.emit(&sender, &message, false).await;
                Ok(Reply::Ack)
            }
            Envelope::Whisper(WhisperRelay {
                target, message, ..
            }) => {
                // Ack regardless of a local match: this shard cannot know
                // whether another neighbor already held the target.
                let socket = {
                    let state = self.state.lock().await;
                    state.pool.get(&target).map(|entry| Arc::clone(&entry.socket))
                };
                if let Some(socket) = socket {
                    if let Err(err) = socket.send(&message).await {
                        warn!(shard = %self.id, target = %target, error = %err, "whisper delivery failed");
                    }
                }
                Ok(Reply::Ack)
            }
            Envelope::Close(_) => Err(RoutingError::Validation {
                reason: "close notices are gateway-bound".into(),
            }),
        }
    }

    /// Client request path. Client-caused failures become 4xx replies, and
    /// every non-upgrade outcome releases the live-count slot the gateway
    /// charged for this request.
    async fn handle_request(
        self: &Arc<Self>,
        env: RequestEnvelope,
    ) -> Result<Reply, RoutingError> {
        let meta = env.meta.clone();
        let result = if upgrade::is_upgrade_intent(&env.request) {
            self.upgrade(env).await
        } else {
            self.dispatch_app(env).await
        };

        let reply = match result {
            Ok(reply) => Ok(reply),
            Err(
                err @ (RoutingError::Protocol { .. }
                | RoutingError::Validation { .. }
                | RoutingError::Application { .. }),
            ) => {
                debug!(shard = %self.id, client = %meta.client, error = %err, "request rejected");
                Ok(Reply::rejection(&err))
            }
            Err(other) => Err(other),
        };

        // Every outcome short of the protocol switch releases the slot the
        // gateway charged for this request, failures included.
        if !matches!(reply, Ok(ref r) if r.is_upgrade()) {
            self.decrement(&meta.client, &meta.gateway).await;
        }
        reply
    }

    /// Handle an upgrade request: protocol validation, identifier
    /// validation, protocol switch, hooks, listener, pool registration.
    pub async fn upgrade(self: &Arc<Self>, env: RequestEnvelope) -> Result<Reply, RoutingError> {
        // Preconditions first, before any state change.
        upgrade::validate_handshake(&env.request)?;
        self.validate_meta(&env.meta)?;

        let RequestEnvelope { meta, request } = env;
        let (socket, events) = self.upgrader.upgrade(&request).await?;

        // The hook observes pre-registration state.
        if let Err(err) = self.app.on_open(self, &meta.client, &socket).await {
            // The protocol already switched; tear the socket down rather
            // than leave the peer on a dangling connection.
            socket.close().await;
            return Err(RoutingError::Application {
                reason: err.to_string(),
            });
        }

        {
            let mut state = self.state.lock().await;
            state.pool.insert(
                meta.client.clone(),
                PoolEntry {
                    gateway: meta.gateway.clone(),
                    socket,
                },
            );
        }
        // Listener starts only once the entry exists, so its eventual
        // decrement always observes the registration.
        self.spawn_listener(meta.client.clone(), meta.gateway.clone(), events);
        self.metrics.connections.inc();
        debug!(shard = %self.id, client = %meta.client, "connection registered");
        Ok(Reply::Upgraded)
    }

    fn validate_meta(&self, meta: &RouteMeta) -> Result<(), RoutingError> {
        if meta.client.as_ref().is_empty() || meta.gateway.as_ref().is_empty() {
            return Err(RoutingError::Validation {
                reason: "missing routing identifiers".into(),
            });
        }
        if meta.shard != self.id {
            return Err(RoutingError::Validation {
                reason: format!("request for shard {}, this shard is {}", meta.shard, self.id),
            });
        }
        Ok(())
    }

    /// Forward socket events to the application hooks. The first close or
    /// error event runs its hook and then decrement-and-deregister exactly
    /// once, ending the task.
    fn spawn_listener(
        self: &Arc<Self>,
        client: ClientId,
        gateway: GatewayId,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        let shard = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(SocketEvent::Message(frame)) => {
                        if let Err(err) = shard.app.on_message(&shard, &client, &frame).await {
                            warn!(shard = %shard.id, client = %client, error = %err, "on_message hook failed");
                        }
                    }
                    Some(SocketEvent::Error(reason)) => {
                        if let Err(err) = shard.app.on_error(&shard, &client, &reason).await {
                            warn!(shard = %shard.id, client = %client, error = %err, "on_error hook failed");
                        }
                        shard.decrement(&client, &gateway).await;
                        break;
                    }
                    // A dropped event stream counts as a close.
                    Some(SocketEvent::Close) | None => {
                        if let Err(err) = shard.app.on_close(&shard, &client).await {
                            warn!(shard = %shard.id, client = %client, error = %err, "on_close hook failed");
                        }
                        shard.decrement(&client, &gateway).await;
                        break;
                    }
                }
            }
        });
    }

    /// Application dispatch for plain requests; errors are caught here and
    /// surfaced as diagnostics, never as corrupted state.
    async fn dispatch_app(self: &Arc<Self>, env: RequestEnvelope) -> Result<Reply, RoutingError> {
        self.validate_meta(&env.meta)?;
        self.app
            .receive(self, &env.meta, env.request)
            .await
            .map_err(|err| RoutingError::Application {
                reason: err.to_string(),
            })
    }

    /// Deliver a message to every local connection except the sender's
    /// (unless `include_self`). Purely local.
    pub async fn emit(&self, sender: &ClientId, message: &[u8], include_self: bool) {
        let sockets: Vec<(ClientId, Arc<dyn crate::socket::DuplexSocket>)> = {
            let state = self.state.lock().await;
            state
                .pool
                .iter()
                .filter(|(client, _)| include_self || *client != sender)
                .map(|(client, entry)| (client.clone(), Arc::clone(&entry.socket)))
                .collect()
        };
        for (client, socket) in sockets {
            if let Err(err) = socket.send(message).await {
                warn!(shard = %self.id, client = %client, error = %err, "local delivery failed");
            }
        }
    }

    /// Emit locally, then relay to every neighbor shard in parallel.
    /// Cross-shard delivery is unordered and best-effort; relay failures
    /// are logged and dropped without blocking the caller.
    pub async fn broadcast(&self, sender: &ClientId, message: &[u8], include_self: bool) {
        self.emit(sender, message, include_self).await;
        let neighbors: Vec<ShardId> = {
            let state = self.state.lock().await;
            state.neighbors.iter().cloned().collect()
        };
        self.spawn_relays(neighbors, move |_| {
            Envelope::Broadcast(BroadcastRelay {
                sender: sender.clone(),
                message: message.to_vec(),
            })
        });
    }

    /// Deliver a message to one client: directly when pooled locally,
    /// otherwise by relaying to every neighbor (only the shard actually
    /// holding the target delivers). A self-whisper is suppressed entirely.
    pub async fn whisper(&self, sender: &ClientId, target: &ClientId, message: &[u8]) {
        if sender == target {
            return;
        }
        let (local_socket, neighbors) = {
            let state = self.state.lock().await;
            (
                state.pool.get(target).map(|entry| Arc::clone(&entry.socket)),
                state.neighbors.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(socket) = local_socket {
            if let Err(err) = socket.send(message).await {
                warn!(shard = %self.id, target = %target, error = %err, "whisper delivery failed");
            }
            return;
        }
        self.spawn_relays(neighbors, move |_| {
            Envelope::Whisper(WhisperRelay {
                sender: sender.clone(),
                target: target.clone(),
                message: message.to_vec(),
            })
        });
    }

    /// Fire a control envelope at each neighbor concurrently, detached from
    /// the caller. Failures are counted and logged, never retried.
    fn spawn_relays(
        &self,
        neighbors: Vec<ShardId>,
        make_envelope: impl Fn(&ShardId) -> Envelope,
    ) {
        if neighbors.is_empty() {
            return;
        }
        let from = self.id.clone();
        let addressing = Arc::clone(&self.addressing);
        let metrics = Arc::clone(&self.metrics);
        let calls: Vec<(ShardId, Envelope)> = neighbors
            .iter()
            .map(|neighbor| (neighbor.clone(), make_envelope(neighbor)))
            .collect();
        tokio::spawn(async move {
            futures::future::join_all(calls.into_iter().map(|(neighbor, envelope)| {
                let addressing = Arc::clone(&addressing);
                let metrics = Arc::clone(&metrics);
                let from = from.clone();
                async move {
                    let result = async {
                        addressing.locate_shard(&neighbor).await?.send(envelope).await
                    }
                    .await;
                    if let Err(err) = result {
                        metrics.relay_failures.inc();
                        warn!(from = %from, to = %neighbor, error = %err, "relay dropped");
                    }
                }
            }))
            .await;
        });
    }

    /// Release a client's slot: deregister the pool entry, then notify the
    /// gateway. The entry is gone before the notice is confirmed; a failed
    /// notice leaves the gateway's count inflated for that slot, which is
    /// accepted and observable rather than silently corrected.
    pub async fn decrement(&self, client: &ClientId, gateway: &GatewayId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.pool.remove(client)
        };
        if removed.is_some() {
            self.metrics.connections.dec();
        }
        let notice = CloseNotice {
            gateway: gateway.clone(),
            shard: self.id.clone(),
            client: client.clone(),
            is_empty: removed.is_some(),
        };
        let result = async {
            self.addressing
                .locate_gateway(gateway)
                .await?
                .send(Envelope::Close(notice))
                .await
        }
        .await;
        if let Err(err) = result {
            self.metrics.relay_failures.inc();
            warn!(shard = %self.id, client = %client, error = %err, "close notice dropped");
        }
    }

    /// Snapshot of the neighbor set, for introspection and tests.
    pub async fn neighbors(&self) -> HashSet<ShardId> {
        self.state.lock().await.neighbors.clone()
    }

    /// Number of live pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::ActorHandle;
    use crate::envelope::{ClientRequest, NeighborIntro};
    use crate::socket::DuplexSocket;
    use crate::testing::LocalCluster;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn intro(neighbor: &str) -> Envelope {
        Envelope::Neighbor(NeighborIntro {
            neighbor: ShardId::new(neighbor),
        })
    }

    /// Addressing that acks every send and counts close notices.
    struct CloseCountingAddressing {
        closes: Arc<AtomicU64>,
    }

    struct CountingHandle {
        closes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl ActorHandle for CountingHandle {
        async fn send(&self, envelope: Envelope) -> Result<Reply, RoutingError> {
            if matches!(envelope, Envelope::Close(_)) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Reply::Ack)
        }
    }

    #[async_trait]
    impl Addressing for CloseCountingAddressing {
        fn create_unique_id(&self) -> ShardId {
            ShardId::new("unused")
        }

        async fn locate_shard(
            &self,
            _shard: &ShardId,
        ) -> Result<Arc<dyn ActorHandle>, RoutingError> {
            Ok(Arc::new(CountingHandle {
                closes: Arc::clone(&self.closes),
            }))
        }

        async fn locate_gateway(
            &self,
            _gateway: &GatewayId,
        ) -> Result<Arc<dyn ActorHandle>, RoutingError> {
            Ok(Arc::new(CountingHandle {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    /// Upgrader whose protocol switch always fails.
    struct FailingUpgrader;

    #[async_trait]
    impl SocketUpgrader for FailingUpgrader {
        async fn upgrade(
            &self,
            _request: &ClientRequest,
        ) -> Result<(Arc<dyn DuplexSocket>, mpsc::UnboundedReceiver<SocketEvent>), RoutingError>
        {
            Err(RoutingError::SocketClosed)
        }
    }

    struct FlagSocket {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DuplexSocket for FlagSocket {
        async fn send(&self, _frame: &[u8]) -> Result<(), RoutingError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Upgrader handing out sockets whose close is externally observable.
    struct FlagUpgrader {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SocketUpgrader for FlagUpgrader {
        async fn upgrade(
            &self,
            _request: &ClientRequest,
        ) -> Result<(Arc<dyn DuplexSocket>, mpsc::UnboundedReceiver<SocketEvent>), RoutingError>
        {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok((
                Arc::new(FlagSocket {
                    closed: Arc::clone(&self.closed),
                }),
                rx,
            ))
        }
    }

    /// Application whose on_open hook rejects every connection.
    struct RejectingApp;

    #[async_trait]
    impl Application for RejectingApp {
        fn identify(&self, _request: &ClientRequest) -> Result<ClientId, RoutingError> {
            Ok(ClientId::new("alice"))
        }

        async fn receive(
            &self,
            _shard: &Arc<ShardActor>,
            _meta: &RouteMeta,
            _request: ClientRequest,
        ) -> Result<Reply, RoutingError> {
            Ok(Reply::Ack)
        }

        async fn on_open(
            &self,
            _shard: &Arc<ShardActor>,
            _client: &ClientId,
            _socket: &Arc<dyn DuplexSocket>,
        ) -> Result<(), RoutingError> {
            Err(RoutingError::Application {
                reason: "not welcome".into(),
            })
        }
    }

    fn upgrade_envelope(client: &str, shard: &str) -> Envelope {
        Envelope::Request(RequestEnvelope {
            meta: RouteMeta {
                gateway: GatewayId::new("gateway-1"),
                client: ClientId::new(client),
                shard: ShardId::new(shard),
            },
            request: LocalCluster::handshake_request(client),
        })
    }

    #[tokio::test]
    async fn reintroducing_a_neighbor_is_a_noop() {
        let cluster = LocalCluster::new(4);
        let conn = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&conn.shard).unwrap();

        shard.handle(intro("shard-x")).await.unwrap();
        shard.handle(intro("shard-x")).await.unwrap();
        shard.handle(intro("shard-y")).await.unwrap();

        let neighbors = shard.neighbors().await;
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&ShardId::new("shard-x")));
    }

    #[tokio::test]
    async fn emit_skips_sender_unless_included() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let bob = cluster.connect("bob").await.unwrap();
        assert_eq!(alice.shard, bob.shard);
        let shard = cluster.addressing.shard(&alice.shard).unwrap();

        shard.emit(&alice.client, b"hi", false).await;
        assert!(alice.socket.sent_frames().await.is_empty());
        assert_eq!(bob.socket.sent_frames().await, vec![b"hi".to_vec()]);

        shard.emit(&alice.client, b"all", true).await;
        assert_eq!(alice.socket.sent_frames().await, vec![b"all".to_vec()]);
    }

    #[tokio::test]
    async fn self_whisper_is_suppressed() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();
        // An unreachable neighbor turns any relay attempt into a counted
        // failure, so a clean counter proves no relay was issued.
        shard.handle(intro("shard-elsewhere")).await.unwrap();
        cluster
            .addressing
            .make_unreachable(&ShardId::new("shard-elsewhere"));

        shard.whisper(&alice.client, &alice.client, b"me").await;
        cluster.settle().await;

        assert!(alice.socket.sent_frames().await.is_empty());
        assert_eq!(cluster.addressing.metrics().relay_failures.get(), 0);
    }

    #[tokio::test]
    async fn whisper_without_neighbors_is_silently_absent() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();
        assert!(shard.neighbors().await.is_empty());

        shard
            .whisper(&alice.client, &ClientId::new("nobody"), b"lost")
            .await;
        cluster.settle().await;
        assert!(alice.socket.sent_frames().await.is_empty());
    }

    #[tokio::test]
    async fn close_event_decrements_exactly_once() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();
        assert_eq!(shard.connection_count().await, 1);
        assert_eq!(cluster.router.live_count(&alice.shard).await, Some(1));

        alice.close();
        cluster.settle().await;

        assert_eq!(shard.connection_count().await, 0);
        assert_eq!(cluster.router.live_count(&alice.shard).await, Some(0));
        // The sole connection was removed, so the sticky mapping is gone.
        assert_eq!(cluster.router.assignment(&alice.client).await, None);
    }

    #[tokio::test]
    async fn error_event_runs_decrement_too() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        alice.fail("peer reset");
        cluster.settle().await;
        assert_eq!(cluster.router.live_count(&alice.shard).await, Some(0));
    }

    #[tokio::test]
    async fn upgrade_for_wrong_shard_is_rejected_before_state_change() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();

        let env = RequestEnvelope {
            meta: RouteMeta {
                gateway: GatewayId::new("gateway-1"),
                client: ClientId::new("mallory"),
                shard: ShardId::new("some-other-shard"),
            },
            request: LocalCluster::handshake_request("mallory"),
        };
        let err = shard.upgrade(env).await.unwrap_err();
        assert!(matches!(err, RoutingError::Validation { .. }));
        assert_eq!(shard.connection_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_handshake_yields_protocol_error() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();

        let mut request = LocalCluster::handshake_request("bob");
        request.headers.remove("Sec-WebSocket-Key");
        let env = RequestEnvelope {
            meta: RouteMeta {
                gateway: GatewayId::new("gateway-1"),
                client: ClientId::new("bob"),
                shard: alice.shard.clone(),
            },
            request,
        };
        let err = shard.upgrade(env).await.unwrap_err();
        assert!(matches!(err, RoutingError::Protocol { code: 400, .. }));
    }

    #[tokio::test]
    async fn relayed_broadcast_is_not_rerelayed() {
        let cluster = LocalCluster::new(4);
        let alice = cluster.connect("alice").await.unwrap();
        let shard = cluster.addressing.shard(&alice.shard).unwrap();
        // A neighbor that would fail loudly if the relay were re-relayed.
        shard.handle(intro("dead-neighbor")).await.unwrap();
        cluster
            .addressing
            .make_unreachable(&ShardId::new("dead-neighbor"));

        shard
            .handle(Envelope::Broadcast(BroadcastRelay {
                sender: ClientId::new("remote-sender"),
                message: b"from afar".to_vec(),
            }))
            .await
            .unwrap();
        cluster.settle().await;

        assert_eq!(alice.socket.sent_frames().await, vec![b"from afar".to_vec()]);
        // No onward relay toward the dead neighbor was attempted.
        assert_eq!(cluster.addressing.metrics().relay_failures.get(), 0);
    }

    #[tokio::test]
    async fn failed_upgrader_still_releases_slot() {
        let closes = Arc::new(AtomicU64::new(0));
        let shard = ShardActor::new(
            ShardId::new("shard-1"),
            Arc::new(crate::testing::ChatApp),
            Arc::new(CloseCountingAddressing {
                closes: Arc::clone(&closes),
            }),
            Arc::new(FailingUpgrader),
            Arc::new(RoutingMetrics::unregistered()),
        );

        let err = shard
            .handle(upgrade_envelope("alice", "shard-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::SocketClosed));
        // The failed switch never registered a connection, but the slot the
        // gateway charged was still released.
        assert_eq!(shard.connection_count().await, 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_on_open_closes_socket_and_releases_slot() {
        let closes = Arc::new(AtomicU64::new(0));
        let socket_closed = Arc::new(AtomicBool::new(false));
        let shard = ShardActor::new(
            ShardId::new("shard-1"),
            Arc::new(RejectingApp),
            Arc::new(CloseCountingAddressing {
                closes: Arc::clone(&closes),
            }),
            Arc::new(FlagUpgrader {
                closed: Arc::clone(&socket_closed),
            }),
            Arc::new(RoutingMetrics::unregistered()),
        );

        let reply = shard
            .handle(upgrade_envelope("alice", "shard-1"))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Response { status: 400, .. }));
        // The already-switched socket was torn down, nothing was pooled,
        // and the gateway got exactly one close notice for the slot.
        assert!(socket_closed.load(Ordering::SeqCst));
        assert_eq!(shard.connection_count().await, 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
