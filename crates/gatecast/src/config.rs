use crate::error::RoutingError;
use crate::types::GatewayId;

/// Configuration for a gateway router instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identity this gateway stamps onto forwarded requests and expects
    /// back on close notices.
    pub gateway_id: GatewayId,
    /// Maximum live connections/requests attributed to one shard before
    /// the router stops offering it and creates a new shard. Default: 100.
    pub shard_capacity: u32,
}

impl GatewayConfig {
    pub fn new(gateway_id: GatewayId) -> Self {
        Self {
            gateway_id,
            shard_capacity: 100,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.shard_capacity == 0 {
            return Err(RoutingError::InvalidConfig {
                reason: "shard_capacity must be at least 1".into(),
            });
        }
        if self.gateway_id.as_ref().is_empty() {
            return Err(RoutingError::InvalidConfig {
                reason: "gateway_id must not be empty".into(),
            });
        }
        Ok(())
    }
}
