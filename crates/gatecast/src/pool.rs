use crate::socket::DuplexSocket;
use crate::types::{ClientId, GatewayId};
use std::collections::HashMap;
use std::sync::Arc;

/// One live connection hosted by a shard.
#[derive(Clone)]
pub struct PoolEntry {
    /// Gateway that routed this connection; decrement notices go back to it.
    pub gateway: GatewayId,
    pub socket: Arc<dyn DuplexSocket>,
}

/// Client id -> live connection, owned by one shard actor.
///
/// An entry exists iff its connection is open; registration happens after a
/// successful upgrade and removal happens on close/error/decrement.
#[derive(Default)]
pub struct ConnectionPool {
    entries: HashMap<ClientId, PoolEntry>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: ClientId, entry: PoolEntry) {
        self.entries.insert(client, entry);
    }

    pub fn remove(&mut self, client: &ClientId) -> Option<PoolEntry> {
        self.entries.remove(client)
    }

    pub fn get(&self, client: &ClientId) -> Option<&PoolEntry> {
        self.entries.get(client)
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.entries.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &PoolEntry)> {
        self.entries.iter()
    }
}
