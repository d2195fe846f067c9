use crate::types::{GatewayId, ShardId};

/// Errors that can occur in the gateway/shard routing system.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// Malformed upgrade request, rejected before any state change.
    #[error("protocol violation ({code}): {reason}")]
    Protocol { code: u16, reason: String },

    /// Missing or mismatched routing identifiers on a request.
    #[error("invalid routing metadata: {reason}")]
    Validation { reason: String },

    /// A close notice addressed a gateway other than the receiver.
    #[error("close notice for gateway {got}, but this gateway is {expected}")]
    GatewayMismatch { expected: GatewayId, got: GatewayId },

    /// A close notice referenced a shard the gateway does not track.
    #[error("close notice for untracked shard {shard}")]
    UnknownShard { shard: ShardId },

    /// The embedding application's handler failed; converted to a
    /// client-visible 4xx at the dispatch boundary.
    #[error("application error: {reason}")]
    Application { reason: String },

    /// The actor addressing collaborator failed to locate or deliver.
    #[error("addressing error: {reason}")]
    Addressing {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Send on a duplex socket whose peer is gone.
    #[error("socket closed")]
    SocketClosed,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl RoutingError {
    /// HTTP-ish status code presented to the client for this failure.
    pub fn status(&self) -> u16 {
        match self {
            RoutingError::Protocol { code, .. } => *code,
            RoutingError::Validation { .. }
            | RoutingError::GatewayMismatch { .. }
            | RoutingError::UnknownShard { .. }
            | RoutingError::Application { .. } => 400,
            RoutingError::Addressing { .. }
            | RoutingError::SocketClosed
            | RoutingError::InvalidConfig { .. } => 500,
        }
    }
}
