use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::addressing::Addressing;
use crate::application::Application;
use crate::availability::AvailabilityTable;
use crate::config::GatewayConfig;
use crate::envelope::{
    ClientRequest, CloseNotice, Envelope, NeighborIntro, Reply, RequestEnvelope, RouteMeta,
};
use crate::error::RoutingError;
use crate::metrics::RoutingMetrics;
use crate::types::{ClientId, GatewayId, ShardId};

/// Routing tier: assigns clients to shards by least-loaded selection under
/// a capacity limit, creating shards on demand and introducing them to
/// their neighbors.
///
/// All tables live behind one mutex, giving the single-operation-at-a-time
/// discipline the invariants rely on even when the host invokes the router
/// from parallel tasks. The lock is never held across an actor-to-actor
/// send.
pub struct GatewayRouter {
    config: GatewayConfig,
    app: Arc<dyn Application>,
    addressing: Arc<dyn Addressing>,
    metrics: Arc<RoutingMetrics>,
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    /// Sticky client -> shard mapping. Entries persist after the connection
    /// ends (stale-but-harmless bias toward the last-known shard) and are
    /// dropped only by a close notice flagged `is_empty`.
    sticky: HashMap<ClientId, ShardId>,
    availability: AvailabilityTable,
    /// Fast-path hint: the shard assigned most recently, kept only while it
    /// still had headroom after that assignment.
    last_shard: Option<ShardId>,
}

impl GatewayRouter {
    pub fn new(
        config: GatewayConfig,
        app: Arc<dyn Application>,
        addressing: Arc<dyn Addressing>,
        metrics: Arc<RoutingMetrics>,
    ) -> Result<Arc<Self>, RoutingError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            app,
            addressing,
            metrics,
            state: Mutex::new(RouterState::default()),
        }))
    }

    pub fn id(&self) -> &GatewayId {
        &self.config.gateway_id
    }

    /// Front door: derive the client id via the application, then route.
    pub async fn handle(&self, request: ClientRequest) -> Result<Reply, RoutingError> {
        let client = self.app.identify(&request)?;
        self.route(&client, request).await
    }

    /// Assign the client to a shard, tag the request with routing metadata
    /// and forward it, returning the shard's reply.
    pub async fn route(
        &self,
        client: &ClientId,
        request: ClientRequest,
    ) -> Result<Reply, RoutingError> {
        let shard = self.assign(client).await;
        let meta = RouteMeta {
            gateway: self.config.gateway_id.clone(),
            client: client.clone(),
            shard: shard.clone(),
        };
        let handle = self.addressing.locate_shard(&shard).await?;
        handle
            .send(Envelope::Request(RequestEnvelope { meta, request }))
            .await
    }

    /// The assignment decision, run per incoming request.
    ///
    /// Candidate order: sticky mapping, then last-used shard, then the head
    /// of the sorted under-capacity list; a stale candidate falls through
    /// to a recompute, and an empty recompute creates a fresh shard. No
    /// path ever pushes a tracked shard's count above the limit.
    async fn assign(&self, client: &ClientId) -> ShardId {
        let limit = self.config.shard_capacity;
        let mut state = self.state.lock().await;

        let candidate = state
            .sticky
            .get(client)
            .cloned()
            .or_else(|| state.last_shard.clone())
            .or_else(|| state.availability.head().cloned());
        let tentative = candidate
            .as_ref()
            .and_then(|shard| state.availability.tentative(shard));

        let (shard, tentative) = match (candidate, tentative) {
            (Some(shard), Some(t)) if t <= limit => (shard, t),
            _ => {
                state.availability.recompute(limit);
                match state.availability.head().cloned() {
                    // Head is strictly under the limit, so head+1 <= limit.
                    Some(head) => {
                        let count = state.availability.tentative(&head).unwrap_or(1);
                        (head, count)
                    }
                    None => {
                        let shard = self.addressing.create_unique_id();
                        info!(shard = %shard, "no shard with headroom, creating");
                        let prior: Vec<ShardId> =
                            state.availability.tracked().cloned().collect();
                        self.spawn_introductions(shard.clone(), prior);
                        (shard, 1)
                    }
                }
            }
        };

        // A shard that just reached capacity is not offered as the
        // fast-path hint next time.
        if tentative < limit {
            state.last_shard = Some(shard.clone());
        }
        state.sticky.insert(client.clone(), shard.clone());
        state.availability.set(&shard, tentative);

        self.metrics.routed.inc();
        self.metrics.shards.set(state.availability.len() as i64);
        debug!(client = %client, shard = %shard, count = tentative, "assigned");
        shard
    }

    /// Introduce a freshly created shard and every previously tracked shard
    /// to each other, pairwise and in parallel, without blocking the route
    /// that triggered the creation.
    ///
    /// The new shard may serve its first request before its neighbor set is
    /// populated; that window is accepted for routing latency. Individual
    /// failures are logged and dropped, never retried.
    fn spawn_introductions(&self, new_shard: ShardId, prior: Vec<ShardId>) {
        if prior.is_empty() {
            return;
        }
        let addressing = Arc::clone(&self.addressing);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let calls: Vec<(ShardId, ShardId)> = prior
                .into_iter()
                .flat_map(|existing| {
                    [
                        (existing.clone(), new_shard.clone()),
                        (new_shard.clone(), existing),
                    ]
                })
                .collect();
            futures::future::join_all(calls.into_iter().map(|(to, neighbor)| {
                let addressing = Arc::clone(&addressing);
                let metrics = Arc::clone(&metrics);
                async move {
                    let intro = Envelope::Neighbor(NeighborIntro {
                        neighbor: neighbor.clone(),
                    });
                    let result = async {
                        addressing.locate_shard(&to).await?.send(intro).await
                    }
                    .await;
                    if let Err(err) = result {
                        metrics.relay_failures.inc();
                        warn!(to = %to, neighbor = %neighbor, error = %err, "neighbor introduction dropped");
                    }
                }
            }))
            .await;
        });
    }

    /// Inbound envelope dispatch; gateways only accept close notices.
    pub async fn receive(&self, envelope: Envelope) -> Result<Reply, RoutingError> {
        match envelope {
            Envelope::Close(notice) => self.handle_close(notice).await,
            other => Err(RoutingError::Validation {
                reason: format!("gateway cannot handle envelope: {other:?}"),
            }),
        }
    }

    /// Handle a shard's close/decrement notice.
    pub async fn handle_close(&self, notice: CloseNotice) -> Result<Reply, RoutingError> {
        if notice.gateway != self.config.gateway_id {
            return Err(RoutingError::GatewayMismatch {
                expected: self.config.gateway_id.clone(),
                got: notice.gateway,
            });
        }
        let mut state = self.state.lock().await;
        if !state.availability.contains(&notice.shard) {
            return Err(RoutingError::UnknownShard {
                shard: notice.shard,
            });
        }
        state.availability.decrement(&notice.shard);
        if notice.is_empty {
            state.sticky.remove(&notice.client);
        }
        let head = state.availability.recompute(self.config.shard_capacity).cloned();
        state.last_shard = head;
        debug!(shard = %notice.shard, client = %notice.client, is_empty = notice.is_empty, "close notice applied");
        Ok(Reply::Ack)
    }

    /// Current sticky assignment for a client, if any.
    pub async fn assignment(&self, client: &ClientId) -> Option<ShardId> {
        self.state.lock().await.sticky.get(client).cloned()
    }

    /// Recorded live count for a shard, if tracked.
    pub async fn live_count(&self, shard: &ShardId) -> Option<u32> {
        self.state.lock().await.availability.get(shard)
    }

    /// Shards with headroom as of the last recompute, ascending by load.
    pub async fn sorted_available(&self) -> Vec<ShardId> {
        self.state.lock().await.availability.sorted_available().to_vec()
    }

    /// All shards this gateway tracks, in first-seen order.
    pub async fn tracked_shards(&self) -> Vec<ShardId> {
        self.state.lock().await.availability.tracked().cloned().collect()
    }
}
