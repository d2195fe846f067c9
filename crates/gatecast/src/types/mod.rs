mod client_id;
mod gateway_id;
mod shard_id;

pub use client_id::ClientId;
pub use gateway_id::GatewayId;
pub use shard_id::ShardId;
