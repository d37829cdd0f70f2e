//! Storage collaborator interface
//!
//! Persistent row storage lives outside this crate; the core talks to it
//! through [`BlockStore`]. Implementations provide storage-level atomicity
//! only — all logical synchronization (single writer, optimistic reads)
//! belongs to the [`crate::lock::SequenceLock`] above this trait.
//!
//! [`MemoryStore`] is the in-crate reference implementation used by tests
//! and the operational binary.

use crate::types::{AuthorizedKey, Block};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Server-side filter for paginated block reads
///
/// Pushed down to storage so traversal variants keep their bounded-memory
/// contract without post-filtering whole pages in the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFilter {
    /// Every block
    All,
    /// Blocks whose timestamp falls in `[from, to]`
    TimeRange {
        /// Inclusive lower bound
        from: DateTime<Utc>,
        /// Inclusive upper bound
        to: DateTime<Utc>,
    },
    /// Blocks carrying an encrypted payload
    EncryptedOnly,
    /// Blocks carrying an off-chain payload reference
    WithOffChainRef,
    /// Blocks with sequence number strictly greater than the given one
    AfterSequence(u64),
}

impl BlockFilter {
    fn matches(&self, block: &Block) -> bool {
        match self {
            BlockFilter::All => true,
            BlockFilter::TimeRange { from, to } => {
                block.timestamp >= *from && block.timestamp <= *to
            }
            BlockFilter::EncryptedOnly => block.encrypted,
            BlockFilter::WithOffChainRef => block.off_chain.is_some(),
            BlockFilter::AfterSequence(seq) => block.sequence_number > *seq,
        }
    }
}

/// Storage operations the chain core consumes
pub trait BlockStore: Send + Sync {
    /// Persist one block; rejects duplicate sequence numbers
    fn append_block(&self, block: &Block) -> Result<()>;

    /// Fetch a block by sequence number
    fn block_by_number(&self, sequence_number: u64) -> Result<Option<Block>>;

    /// Fetch up to `limit` blocks with sequence number >= `start_seq`,
    /// ascending
    fn blocks_paginated(&self, start_seq: u64, limit: usize) -> Result<Vec<Block>>;

    /// Paginated fetch with a storage-side filter
    ///
    /// Pagination still advances by sequence number: the page covers
    /// sequence numbers `[start_seq, start_seq + limit)` and returns the
    /// matching subset, so callers can stride without storage re-scanning.
    fn blocks_filtered(
        &self,
        filter: &BlockFilter,
        start_seq: u64,
        limit: usize,
    ) -> Result<Vec<Block>>;

    /// Number of blocks in the chain
    fn block_count(&self) -> Result<u64>;

    /// Highest-sequence block, if any
    fn latest_block(&self) -> Result<Option<Block>>;

    /// Sequence number the next appended block will receive
    ///
    /// Read-only peek; must not consume or reserve anything. The core
    /// only calls this inside the write critical section, where the
    /// single-writer guarantee makes peek-then-append race-free.
    fn next_sequence_number(&self) -> Result<u64>;

    /// All authorized keys, including revoked ones
    fn authorized_keys(&self) -> Result<Vec<AuthorizedKey>>;

    /// Insert or replace an authorized key (keyed by `key_id`)
    fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<()>;

    /// Remove every block with sequence number > `sequence_number`;
    /// returns the number removed
    fn truncate_after(&self, sequence_number: u64) -> Result<u64>;
}

/// In-memory [`BlockStore`] backed by an ordered map
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blocks: BTreeMap<u64, Block>,
    keys: Vec<AuthorizedKey>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryStore {
    fn append_block(&self, block: &Block) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.blocks.contains_key(&block.sequence_number) {
            return Err(Error::Storage(format!(
                "Duplicate sequence number: {}",
                block.sequence_number
            )));
        }
        inner.blocks.insert(block.sequence_number, block.clone());
        Ok(())
    }

    fn block_by_number(&self, sequence_number: u64) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(&sequence_number).cloned())
    }

    fn blocks_paginated(&self, start_seq: u64, limit: usize) -> Result<Vec<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .blocks
            .range(start_seq..)
            .take(limit)
            .map(|(_, block)| block.clone())
            .collect())
    }

    fn blocks_filtered(
        &self,
        filter: &BlockFilter,
        start_seq: u64,
        limit: usize,
    ) -> Result<Vec<Block>> {
        let inner = self.inner.read();
        let end = start_seq.saturating_add(limit as u64);
        Ok(inner
            .blocks
            .range(start_seq..end)
            .filter(|(_, block)| filter.matches(block))
            .map(|(_, block)| block.clone())
            .collect())
    }

    fn block_count(&self) -> Result<u64> {
        Ok(self.inner.read().blocks.len() as u64)
    }

    fn latest_block(&self) -> Result<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner.blocks.values().next_back().cloned())
    }

    fn next_sequence_number(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(match inner.blocks.keys().next_back() {
            Some(last) => last + 1,
            None => 0,
        })
    }

    fn authorized_keys(&self) -> Result<Vec<AuthorizedKey>> {
        Ok(self.inner.read().keys.clone())
    }

    fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.keys.iter_mut().find(|k| k.key_id == key.key_id) {
            Some(existing) => *existing = key.clone(),
            None => inner.keys.push(key.clone()),
        }
        Ok(())
    }

    fn truncate_after(&self, sequence_number: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let doomed: Vec<u64> = inner
            .blocks
            .range(sequence_number + 1..)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            inner.blocks.remove(seq);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signature;
    use uuid::Uuid;

    fn test_block(seq: u64) -> Block {
        let mut block = Block {
            sequence_number: seq,
            previous_hash: [0u8; 32],
            content_hash: [1u8; 32],
            block_hash: [0u8; 32],
            content: format!("block-{}", seq).into_bytes(),
            encrypted: seq % 2 == 1,
            off_chain: None,
            timestamp: Utc::now(),
            signer_key_id: Uuid::nil(),
            signature: Signature::from_bytes([0u8; 64]),
        };
        block.block_hash = block.compute_hash();
        block
    }

    #[test]
    fn test_append_and_get() {
        let store = MemoryStore::new();
        store.append_block(&test_block(0)).unwrap();

        let block = store.block_by_number(0).unwrap().unwrap();
        assert_eq!(block.sequence_number, 0);
        assert!(store.block_by_number(1).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let store = MemoryStore::new();
        store.append_block(&test_block(0)).unwrap();
        assert!(store.append_block(&test_block(0)).is_err());
    }

    #[test]
    fn test_next_sequence_peek() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence_number().unwrap(), 0);

        store.append_block(&test_block(0)).unwrap();
        store.append_block(&test_block(1)).unwrap();
        assert_eq!(store.next_sequence_number().unwrap(), 2);
        // Peeking does not consume
        assert_eq!(store.next_sequence_number().unwrap(), 2);
    }

    #[test]
    fn test_pagination_ascending() {
        let store = MemoryStore::new();
        for seq in 0..10 {
            store.append_block(&test_block(seq)).unwrap();
        }

        let page = store.blocks_paginated(3, 4).unwrap();
        let seqs: Vec<u64> = page.iter().map(|b| b.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);

        // Short final page
        let page = store.blocks_paginated(8, 4).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_filter_pushdown() {
        let store = MemoryStore::new();
        for seq in 0..10 {
            store.append_block(&test_block(seq)).unwrap();
        }

        let page = store
            .blocks_filtered(&BlockFilter::EncryptedOnly, 0, 10)
            .unwrap();
        assert_eq!(page.len(), 5);
        assert!(page.iter().all(|b| b.encrypted));

        let page = store
            .blocks_filtered(&BlockFilter::AfterSequence(6), 0, 10)
            .unwrap();
        let seqs: Vec<u64> = page.iter().map(|b| b.sequence_number).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
    }

    #[test]
    fn test_time_range_filter() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for seq in 0..10 {
            let mut block = test_block(seq);
            block.timestamp = base + chrono::Duration::seconds(seq as i64);
            block.block_hash = block.compute_hash();
            store.append_block(&block).unwrap();
        }

        // Bounds are inclusive on both ends
        let filter = BlockFilter::TimeRange {
            from: base + chrono::Duration::seconds(2),
            to: base + chrono::Duration::seconds(5),
        };
        let page = store.blocks_filtered(&filter, 0, 10).unwrap();
        let seqs: Vec<u64> = page.iter().map(|b| b.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);

        // Empty window before the chain started
        let filter = BlockFilter::TimeRange {
            from: base - chrono::Duration::seconds(10),
            to: base - chrono::Duration::seconds(5),
        };
        assert!(store.blocks_filtered(&filter, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_after() {
        let store = MemoryStore::new();
        for seq in 0..10 {
            store.append_block(&test_block(seq)).unwrap();
        }

        let removed = store.truncate_after(6).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.block_count().unwrap(), 7);
        assert_eq!(
            store.latest_block().unwrap().unwrap().sequence_number,
            6
        );

        // Idempotent when nothing is above the cut
        assert_eq!(store.truncate_after(6).unwrap(), 0);
    }

    #[test]
    fn test_key_upsert() {
        let store = MemoryStore::new();
        let mut key = AuthorizedKey::new(Uuid::new_v4(), [3u8; 32], "ops");
        store.put_authorized_key(&key).unwrap();
        assert_eq!(store.authorized_keys().unwrap().len(), 1);

        key.revoked = true;
        store.put_authorized_key(&key).unwrap();
        let keys = store.authorized_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].revoked);
    }
}
