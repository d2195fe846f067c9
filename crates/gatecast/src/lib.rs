//! Gateway/shard routing and fan-out for real-time duplex connections.
//!
//! `gatecast` splits a connection-oriented application into a routing tier
//! and a hosting tier. The [`router::GatewayRouter`] assigns each client to
//! a shard by least-loaded selection under a capacity limit, creating
//! shards on demand and introducing them to their neighbors. Each
//! [`shard::ShardActor`] holds live duplex connections, fans messages out
//! locally (`emit`), across shards (`broadcast`), or to a single target
//! (`whisper`), and reports connection lifecycle back to its gateway.
//!
//! The embedding application plugs in through three seams: the
//! [`application::Application`] capability trait for identity and hooks,
//! the [`addressing::Addressing`] trait for actor creation/location, and
//! the [`socket::SocketUpgrader`] primitive for the protocol switch.
//! [`testing::LocalCluster`] wires all three in-process.

pub mod addressing;
pub mod application;
pub mod availability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod shard;
pub mod socket;
pub mod testing;
pub mod types;
pub mod upgrade;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::addressing::{ActorHandle, Addressing};
    pub use crate::application::Application;
    pub use crate::config::GatewayConfig;
    pub use crate::envelope::{ClientRequest, Envelope, Reply, RouteMeta};
    pub use crate::error::RoutingError;
    pub use crate::router::GatewayRouter;
    pub use crate::shard::ShardActor;
    pub use crate::socket::{DuplexSocket, SocketEvent, SocketUpgrader};
    pub use crate::types::{ClientId, GatewayId, ShardId};
}
