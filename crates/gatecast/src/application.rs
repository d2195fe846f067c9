use crate::envelope::{ClientRequest, Reply, RouteMeta};
use crate::error::RoutingError;
use crate::shard::ShardActor;
use crate::socket::DuplexSocket;
use crate::types::ClientId;
use async_trait::async_trait;
use std::sync::Arc;

/// Capability set the embedding application supplies to gateway and shard.
///
/// One implementation is injected at construction into both tiers; the
/// gateway only uses [`identify`](Self::identify), shards use the rest.
/// Lifecycle hooks default to no-ops. Errors raised by any hook are caught
/// at the dispatch boundary and converted to a client-visible 4xx; they
/// never corrupt routing state.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Derive the stable client id for an incoming request.
    fn identify(&self, request: &ClientRequest) -> Result<ClientId, RoutingError>;

    /// Business-logic handler for plain (non-upgrade, non-control) requests.
    ///
    /// `shard` is the hosting shard, usable for [`ShardActor::emit`],
    /// [`ShardActor::broadcast`] and [`ShardActor::whisper`].
    async fn receive(
        &self,
        shard: &Arc<ShardActor>,
        meta: &RouteMeta,
        request: ClientRequest,
    ) -> Result<Reply, RoutingError>;

    /// Called after a successful upgrade, before the pool entry is
    /// registered; the hook observes pre-registration state.
    async fn on_open(
        &self,
        shard: &Arc<ShardActor>,
        client: &ClientId,
        socket: &Arc<dyn DuplexSocket>,
    ) -> Result<(), RoutingError> {
        let _ = (shard, client, socket);
        Ok(())
    }

    /// Called for every incoming frame on a live connection.
    async fn on_message(
        &self,
        shard: &Arc<ShardActor>,
        client: &ClientId,
        frame: &[u8],
    ) -> Result<(), RoutingError> {
        let _ = (shard, client, frame);
        Ok(())
    }

    /// Called when a connection closes, before decrement-and-deregister.
    async fn on_close(
        &self,
        shard: &Arc<ShardActor>,
        client: &ClientId,
    ) -> Result<(), RoutingError> {
        let _ = (shard, client);
        Ok(())
    }

    /// Called when a connection errors, before decrement-and-deregister.
    async fn on_error(
        &self,
        shard: &Arc<ShardActor>,
        client: &ClientId,
        reason: &str,
    ) -> Result<(), RoutingError> {
        let _ = (shard, client, reason);
        Ok(())
    }
}
