//! Bounded-memory batch traversal over the chain
//!
//! Sequential ascending scan in fixed-size pages, used by validation,
//! export and recovery. Peak memory is O(batch_size) regardless of chain
//! length. The engine never touches the sequence lock; callers needing a
//! consistent snapshot hold one read stamp across the whole traversal and
//! restrict the consumer to lock-free calls.

use crate::store::{BlockFilter, BlockStore};
use crate::types::Block;
use crate::{Error, Result};

/// Consumer verdict after each batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    /// Fetch the next batch
    Continue,
    /// Terminate the traversal early
    Stop,
}

/// What a finished traversal covered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalSummary {
    /// Blocks handed to the consumer
    pub blocks_visited: u64,
    /// Batches delivered
    pub batches: u64,
    /// Whether the consumer stopped the scan early
    pub stopped_early: bool,
}

/// Batch scan engine over a [`BlockStore`]
pub struct BatchTraversal<'a> {
    store: &'a dyn BlockStore,
    batch_size: usize,
}

impl<'a> BatchTraversal<'a> {
    /// Create an engine fetching at most `batch_size` blocks per page
    pub fn new(store: &'a dyn BlockStore, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("Batch size must be positive".to_string()));
        }
        Ok(Self { store, batch_size })
    }

    /// Visit the whole chain in ascending, gap-free batches
    ///
    /// The final batch may be short. `consumer` errors abort the traversal
    /// and propagate.
    pub fn traverse<F>(&self, consumer: F) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        self.run(None, consumer)
    }

    /// Visit only blocks matching `filter`, same bounded-memory contract
    ///
    /// The filter is pushed down to storage; batches stay ascending but may
    /// be sparse relative to sequence numbers.
    pub fn traverse_filtered<F>(&self, filter: BlockFilter, consumer: F) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        self.run(Some(filter), consumer)
    }

    fn run<F>(&self, filter: Option<BlockFilter>, mut consumer: F) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        let mut next_seq = 0u64;
        let mut summary = TraversalSummary {
            blocks_visited: 0,
            batches: 0,
            stopped_early: false,
        };

        loop {
            let page = match &filter {
                Some(filter) => self.store.blocks_filtered(filter, next_seq, self.batch_size)?,
                None => self.store.blocks_paginated(next_seq, self.batch_size)?,
            };

            // Filtered pages stride by sequence range, so an empty page does
            // not imply end-of-chain; unfiltered pagination does. The bound
            // comes from the highest stored block, never the sequence
            // allocator: a scan must not touch allocation state.
            let exhausted = match &filter {
                Some(_) => match self.store.latest_block()? {
                    Some(last) => next_seq > last.sequence_number,
                    None => true,
                },
                None => page.is_empty(),
            };
            if exhausted {
                break;
            }

            next_seq = match &filter {
                Some(_) => next_seq + self.batch_size as u64,
                None => match page.last() {
                    Some(last) => last.sequence_number + 1,
                    None => next_seq + self.batch_size as u64,
                },
            };

            if page.is_empty() {
                continue;
            }

            summary.blocks_visited += page.len() as u64;
            summary.batches += 1;

            if consumer(&page)? == BatchControl::Stop {
                summary.stopped_early = true;
                break;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Signature;
    use chrono::Utc;
    use uuid::Uuid;

    fn seeded_store(count: u64) -> MemoryStore {
        let store = MemoryStore::new();
        for seq in 0..count {
            let mut block = Block {
                sequence_number: seq,
                previous_hash: [0u8; 32],
                content_hash: [1u8; 32],
                block_hash: [0u8; 32],
                content: vec![],
                encrypted: seq % 3 == 0,
                off_chain: None,
                timestamp: Utc::now(),
                signer_key_id: Uuid::nil(),
                signature: Signature::from_bytes([0u8; 64]),
            };
            block.block_hash = block.compute_hash();
            store.append_block(&block).unwrap();
        }
        store
    }

    #[test]
    fn test_visits_every_block_in_ceil_batches() {
        let store = seeded_store(23);
        let engine = BatchTraversal::new(&store, 5).unwrap();

        let mut seen = Vec::new();
        let summary = engine
            .traverse(|batch| {
                seen.extend(batch.iter().map(|b| b.sequence_number));
                Ok(BatchControl::Continue)
            })
            .unwrap();

        assert_eq!(summary.blocks_visited, 23);
        assert_eq!(summary.batches, 5); // ceil(23 / 5)
        assert!(!summary.stopped_early);

        // Strictly increasing, no duplicates, no gaps
        let expected: Vec<u64> = (0..23).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_early_stop_bounds_work() {
        let store = seeded_store(100);
        let engine = BatchTraversal::new(&store, 10).unwrap();

        let mut batches_seen = 0;
        let summary = engine
            .traverse(|_| {
                batches_seen += 1;
                if batches_seen == 3 {
                    Ok(BatchControl::Stop)
                } else {
                    Ok(BatchControl::Continue)
                }
            })
            .unwrap();

        assert!(summary.stopped_early);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.blocks_visited, 30);
    }

    #[test]
    fn test_consumer_error_propagates() {
        let store = seeded_store(10);
        let engine = BatchTraversal::new(&store, 4).unwrap();

        let result = engine.traverse(|_| Err(Error::Other("consumer failed".to_string())));
        assert!(result.is_err());
    }

    #[test]
    fn test_filtered_traversal_visits_matches_only() {
        let store = seeded_store(30);
        let engine = BatchTraversal::new(&store, 7).unwrap();

        let mut seen = Vec::new();
        engine
            .traverse_filtered(BlockFilter::EncryptedOnly, |batch| {
                seen.extend(batch.iter().map(|b| b.sequence_number));
                Ok(BatchControl::Continue)
            })
            .unwrap();

        let expected: Vec<u64> = (0..30).filter(|s| s % 3 == 0).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_filtered_scan_leaves_sequence_allocation_untouched() {
        use crate::types::AuthorizedKey;
        use std::sync::atomic::{AtomicU64, Ordering};

        // Store whose sequence-number method genuinely allocates, as a
        // persistent implementation with an atomic counter would
        struct AllocatingStore {
            inner: MemoryStore,
            allocations: AtomicU64,
        }

        impl BlockStore for AllocatingStore {
            fn append_block(&self, block: &Block) -> Result<()> {
                self.inner.append_block(block)
            }
            fn block_by_number(&self, seq: u64) -> Result<Option<Block>> {
                self.inner.block_by_number(seq)
            }
            fn blocks_paginated(&self, start_seq: u64, limit: usize) -> Result<Vec<Block>> {
                self.inner.blocks_paginated(start_seq, limit)
            }
            fn blocks_filtered(
                &self,
                filter: &BlockFilter,
                start_seq: u64,
                limit: usize,
            ) -> Result<Vec<Block>> {
                self.inner.blocks_filtered(filter, start_seq, limit)
            }
            fn block_count(&self) -> Result<u64> {
                self.inner.block_count()
            }
            fn latest_block(&self) -> Result<Option<Block>> {
                self.inner.latest_block()
            }
            fn next_sequence_number(&self) -> Result<u64> {
                Ok(self.allocations.fetch_add(1, Ordering::SeqCst))
            }
            fn authorized_keys(&self) -> Result<Vec<AuthorizedKey>> {
                self.inner.authorized_keys()
            }
            fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<()> {
                self.inner.put_authorized_key(key)
            }
            fn truncate_after(&self, seq: u64) -> Result<u64> {
                self.inner.truncate_after(seq)
            }
        }

        let store = AllocatingStore {
            inner: seeded_store(10),
            allocations: AtomicU64::new(10),
        };

        let engine = BatchTraversal::new(&store, 3).unwrap();
        let mut seen = Vec::new();
        engine
            .traverse_filtered(BlockFilter::EncryptedOnly, |batch| {
                seen.extend(batch.iter().map(|b| b.sequence_number));
                Ok(BatchControl::Continue)
            })
            .unwrap();

        let expected: Vec<u64> = (0..10).filter(|s| s % 3 == 0).collect();
        assert_eq!(seen, expected);
        // A read-only scan must not burn sequence allocations
        assert_eq!(store.allocations.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_empty_chain() {
        let store = MemoryStore::new();
        let engine = BatchTraversal::new(&store, 10).unwrap();

        let summary = engine.traverse(|_| Ok(BatchControl::Continue)).unwrap();
        assert_eq!(summary.blocks_visited, 0);
        assert_eq!(summary.batches, 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let store = MemoryStore::new();
        assert!(BatchTraversal::new(&store, 0).is_err());
    }
}
