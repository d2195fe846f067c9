use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one gateway router instance.
///
/// There is one gateway per logical client group; shards address their
/// close notices back to it by this id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct GatewayId(pub String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for GatewayId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
