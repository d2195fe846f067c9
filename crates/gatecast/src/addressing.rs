use crate::envelope::{Envelope, Reply};
use crate::error::RoutingError;
use crate::types::{GatewayId, ShardId};
use async_trait::async_trait;
use std::sync::Arc;

/// A located actor that envelopes can be delivered to.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    /// Deliver an envelope and await the reply.
    async fn send(&self, envelope: Envelope) -> Result<Reply, RoutingError>;
}

/// Actor creation/location collaborator provided by the host.
///
/// The core never retries or times out these calls; delivery policy lives
/// in the implementation. `testing::LocalCluster` provides an in-process
/// version for tests and embedders without a distributed runtime.
#[async_trait]
pub trait Addressing: Send + Sync {
    /// Mint a fresh shard id. The shard actor itself is created lazily on
    /// first [`locate_shard`](Self::locate_shard).
    fn create_unique_id(&self) -> ShardId;

    async fn locate_shard(&self, shard: &ShardId) -> Result<Arc<dyn ActorHandle>, RoutingError>;

    async fn locate_gateway(
        &self,
        gateway: &GatewayId,
    ) -> Result<Arc<dyn ActorHandle>, RoutingError>;
}
