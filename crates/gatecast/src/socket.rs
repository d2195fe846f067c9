use crate::envelope::ClientRequest;
use crate::error::RoutingError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events surfaced by a live duplex socket.
///
/// Exactly one terminal event (`Close` or `Error`) ends the stream; the
/// shard runs its close/error hook and then decrements exactly once.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// An incoming frame from the client.
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// Send half of an upgraded duplex connection.
#[async_trait]
pub trait DuplexSocket: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<(), RoutingError>;

    async fn close(&self);
}

/// Host primitive that turns a validated upgrade request into a connected
/// duplex channel plus its event stream.
///
/// The shard validates the handshake before calling this; implementations
/// only perform the protocol switch.
#[async_trait]
pub trait SocketUpgrader: Send + Sync {
    async fn upgrade(
        &self,
        request: &ClientRequest,
    ) -> Result<(Arc<dyn DuplexSocket>, mpsc::UnboundedReceiver<SocketEvent>), RoutingError>;
}
