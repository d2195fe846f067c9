use std::collections::HashMap;

use crate::types::ShardId;

/// Per-shard live-count bookkeeping for the gateway router.
///
/// Holds the availability index (shard -> live count) plus the derived
/// ascending-by-load list of shards still under the capacity limit. The
/// derived list is only rebuilt when [`recompute`](Self::recompute) is
/// called; between recomputes it may be stale, which the router accepts.
///
/// Ties in the sorted list resolve to the shard tracked earlier, so the
/// ordering is deterministic regardless of map iteration order.
#[derive(Debug, Default)]
pub struct AvailabilityTable {
    counts: HashMap<ShardId, u32>,
    /// Tracked shards in first-seen order.
    order: Vec<ShardId>,
    sorted_available: Vec<ShardId>,
}

impl AvailabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live count for a shard, if tracked.
    pub fn get(&self, shard: &ShardId) -> Option<u32> {
        self.counts.get(shard).copied()
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        self.counts.contains_key(shard)
    }

    /// Live count plus one for a prospective assignment, saturating so a
    /// count at `u32::MAX` cannot wrap. `None` when the shard is untracked.
    pub fn tentative(&self, shard: &ShardId) -> Option<u32> {
        self.get(shard).map(|count| count.saturating_add(1))
    }

    /// Number of tracked shards.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tracked shards in first-seen order.
    pub fn tracked(&self) -> impl Iterator<Item = &ShardId> {
        self.order.iter()
    }

    /// Record a shard's live count, tracking the shard if new.
    pub fn set(&mut self, shard: &ShardId, count: u32) {
        if self.counts.insert(shard.clone(), count).is_none() {
            self.order.push(shard.clone());
        }
    }

    /// Decrement a shard's live count, clamped at zero.
    ///
    /// Returns the new count, or `None` when the shard is untracked.
    pub fn decrement(&mut self, shard: &ShardId) -> Option<u32> {
        let count = self.counts.get_mut(shard)?;
        *count = count.saturating_sub(1);
        Some(*count)
    }

    /// Rebuild the sorted under-capacity list: shards with count strictly
    /// below `limit`, ascending by count, ties by first-seen order.
    ///
    /// Returns the new head, if any.
    pub fn recompute(&mut self, limit: u32) -> Option<&ShardId> {
        let mut available: Vec<ShardId> = self
            .order
            .iter()
            .filter(|shard| self.counts[*shard] < limit)
            .cloned()
            .collect();
        // Stable sort keeps first-seen order among equal counts.
        available.sort_by_key(|shard| self.counts[shard]);
        self.sorted_available = available;
        self.head()
    }

    /// Head of the sorted under-capacity list as of the last recompute.
    pub fn head(&self) -> Option<&ShardId> {
        self.sorted_available.first()
    }

    /// The sorted under-capacity list as of the last recompute.
    pub fn sorted_available(&self) -> &[ShardId] {
        &self.sorted_available
    }
}
