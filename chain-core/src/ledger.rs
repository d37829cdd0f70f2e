//! Main ledger orchestration layer
//!
//! Composes the sequence lock, storage, validation, traversal and recovery
//! into the public API. Each operation uses the weakest lock mode its actual
//! read/write behavior allows: optimistic with read-lock fallback for point
//! reads, the read lock held across whole-chain scans, the write lock for
//! every mutation.
//!
//! # Dual-mode methods
//!
//! Operations invoked both externally and from inside an already-held lock
//! come as a triple: `op()` acquires and releases the lock around the work,
//! `op_locked(&token, ..)` performs no locking and its token is only
//! obtainable from a live stamp, and a private `op_inner()` is the single
//! source of truth. The recovery manager calls only `_locked` variants, so
//! the facade/recovery call graph never reacquires the non-reentrant lock.
//!
//! # Example
//!
//! ```no_run
//! use chain_core::{Config, Ledger};
//! use chain_core::crypto::KeyPair;
//! use chain_core::types::AuthorizedKey;
//! use uuid::Uuid;
//!
//! fn main() -> chain_core::Result<()> {
//!     let ledger = Ledger::in_memory(Config::default());
//!     let signer = KeyPair::generate();
//!     let key = AuthorizedKey::new(Uuid::new_v4(), signer.public_key(), "ops");
//!     ledger.add_authorized_key(key)?;
//!
//!     let block = ledger.append_block(b"first entry".to_vec(), &signer)?;
//!     assert_eq!(block.sequence_number, 0);
//!     Ok(())
//! }
//! ```

use crate::crypto::{hash_bytes, KeyPair};
use crate::lock::{ReadStamp, ReadToken, SequenceLock, WriteStamp, WriteToken};
use crate::metrics::Metrics;
use crate::recovery::RecoveryManager;
use crate::store::{BlockFilter, BlockStore, MemoryStore};
use crate::traversal::{BatchControl, BatchTraversal, TraversalSummary};
use crate::types::{
    AuthorizedKey, Block, BlockValidity, ChainDiagnostic, OffChainRef, RecoveryResult, Signature,
    ValidationReport,
};
use crate::validation::{validate_block, ChainScanner};
use crate::{Config, Error, Result};
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Payload options for an append
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Content is ciphertext
    pub encrypted: bool,
    /// Large payload stored outside the chain
    pub off_chain: Option<OffChainRef>,
}

/// Main ledger interface
pub struct Ledger {
    /// The single lock serializing all mutations on this instance
    lock: SequenceLock,

    /// Storage collaborator
    store: Arc<dyn BlockStore>,

    /// Configuration
    config: Config,

    /// Prometheus collectors
    metrics: Metrics,
}

impl Ledger {
    /// Open a ledger over the given storage collaborator
    pub fn open(config: Config, store: Arc<dyn BlockStore>) -> Self {
        let lock = SequenceLock::new(config.lock.trace_lifecycle);
        Self {
            lock,
            store,
            config,
            metrics: Metrics::default(),
        }
    }

    /// Open a ledger over an in-memory store
    pub fn in_memory(config: Config) -> Self {
        Self::open(config, Arc::new(MemoryStore::new()))
    }

    /// The instance's sequence lock (instrumentation access)
    pub fn sequence_lock(&self) -> &SequenceLock {
        &self.lock
    }

    /// Prometheus collectors for this instance
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Lock helpers

    fn acquire_write(&self) -> Result<WriteStamp<'_>> {
        let stamp = match self.config.lock.write_deadline_ms {
            Some(ms) => self.lock.acquire_write_for(Duration::from_millis(ms))?,
            None => self.lock.acquire_write(),
        };
        self.metrics.record_write_acquisition();
        Ok(stamp)
    }

    fn acquire_read(&self) -> ReadStamp<'_> {
        let stamp = self.lock.acquire_read();
        self.metrics.record_read_acquisition();
        stamp
    }

    /// Hot-path read: optimistic acquire, read, validate; fall back to the
    /// read lock when a write intervened or the read failed mid-write
    fn read_consistent<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        let stamp = self.lock.acquire_optimistic();
        let result = op();
        if self.lock.validate(&stamp) {
            // No write intervened; success and failure are both definitive
            return result;
        }
        self.metrics.record_optimistic_retry();
        let _read = self.acquire_read();
        op()
    }

    // Append path

    /// Append a new signed block
    ///
    /// The content hash is computed outside the lock; sequence allocation,
    /// linkage, signing and the single persist happen inside the write
    /// critical section. The lock is released only after full persistence,
    /// so no reader observes a partially committed predecessor link.
    pub fn append_block(&self, content: Vec<u8>, signer: &KeyPair) -> Result<Block> {
        self.append_block_with(content, signer, AppendOptions::default())
    }

    /// Append with payload options (encrypted marker, off-chain reference)
    pub fn append_block_with(
        &self,
        content: Vec<u8>,
        signer: &KeyPair,
        options: AppendOptions,
    ) -> Result<Block> {
        let content_hash = match &options.off_chain {
            Some(off_chain) => {
                // Off-chain blocks bind the referenced payload's hash; inline
                // content would be unverifiable alongside it
                if !content.is_empty() {
                    return Err(Error::InvalidBlock(
                        "Off-chain blocks must not carry inline content".to_string(),
                    ));
                }
                off_chain.content_hash
            }
            None => hash_bytes(&content),
        };

        let stamp = self.acquire_write()?;
        let started = Instant::now();
        let block = self.append_block_inner(content, content_hash, signer, options);
        drop(stamp);

        if block.is_ok() {
            self.metrics.record_append(started.elapsed().as_secs_f64());
        }
        block
    }

    fn append_block_inner(
        &self,
        content: Vec<u8>,
        content_hash: [u8; 32],
        signer: &KeyPair,
        options: AppendOptions,
    ) -> Result<Block> {
        let timestamp = Utc::now();

        let keys = self.store.authorized_keys()?;
        let public_key = signer.public_key();
        let signer_key = keys
            .iter()
            .find(|k| k.public_key == public_key && k.usable_at(timestamp))
            .ok_or_else(|| {
                Error::Signature("Signer is not an authorized, unrevoked key".to_string())
            })?;

        let sequence_number = self.store.next_sequence_number()?;
        let previous_hash = match self.store.latest_block()? {
            Some(prev) => prev.block_hash,
            None => [0u8; 32],
        };

        let mut block = Block {
            sequence_number,
            previous_hash,
            content_hash,
            block_hash: [0u8; 32],
            content,
            encrypted: options.encrypted,
            off_chain: options.off_chain,
            timestamp,
            signer_key_id: signer_key.key_id,
            signature: Signature::from_bytes([0u8; 64]),
        };
        block.block_hash = block.compute_hash();
        block.signature = signer.sign(&block.block_hash);

        self.store.append_block(&block)?;

        tracing::debug!(
            sequence_number,
            signer_key_id = %block.signer_key_id,
            "Block appended"
        );

        Ok(block)
    }

    // Point reads (optimistic with read-lock fallback)

    /// Get block by sequence number
    pub fn get_block(&self, sequence_number: u64) -> Result<Block> {
        self.read_consistent(|| {
            self.store
                .block_by_number(sequence_number)?
                .ok_or(Error::BlockNotFound(sequence_number))
        })
    }

    /// Number of blocks in the chain
    pub fn block_count(&self) -> Result<u64> {
        self.read_consistent(|| self.store.block_count())
    }

    /// Highest-sequence block, if any
    pub fn latest_block(&self) -> Result<Option<Block>> {
        self.read_consistent(|| self.store.latest_block())
    }

    // Dual-mode: single-block validation

    /// Validate one block against its predecessor and the key set
    pub fn validate_block(&self, sequence_number: u64) -> Result<BlockValidity> {
        let stamp = self.acquire_read();
        self.validate_block_locked(stamp.token(), sequence_number)
    }

    /// Caller-locked variant of [`Ledger::validate_block`]; the token proves the lock is held
    pub fn validate_block_locked(
        &self,
        _token: &ReadToken,
        sequence_number: u64,
    ) -> Result<BlockValidity> {
        self.validate_block_inner(sequence_number)
    }

    fn validate_block_inner(&self, sequence_number: u64) -> Result<BlockValidity> {
        let block = self
            .store
            .block_by_number(sequence_number)?
            .ok_or(Error::BlockNotFound(sequence_number))?;

        let previous_hash = if sequence_number == 0 {
            None
        } else {
            match self.store.block_by_number(sequence_number - 1)? {
                Some(prev) => Some(prev.block_hash),
                // Predecessor missing: the link cannot be judged
                None => return Ok(BlockValidity::Unknown),
            }
        };

        let keys = self.store.authorized_keys()?;
        Ok(validate_block(&block, previous_hash.as_ref(), &keys))
    }

    // Dual-mode: quick chain validation (stop at first corruption)

    /// Validate the whole chain, stopping at the first corrupted block
    pub fn validate_chain(&self) -> Result<ValidationReport> {
        let stamp = self.acquire_read();
        self.validate_chain_locked(stamp.token())
    }

    /// Caller-locked variant of [`Ledger::validate_chain`]; the token proves the lock is held
    pub fn validate_chain_locked(&self, _token: &ReadToken) -> Result<ValidationReport> {
        self.validate_chain_inner()
    }

    fn validate_chain_inner(&self) -> Result<ValidationReport> {
        let keys = self.store.authorized_keys()?;
        let scanner = ChainScanner::new(
            self.store.as_ref(),
            &keys,
            self.config.traversal.default_batch_size,
        );
        scanner.quick_scan()
    }

    // Dual-mode: full diagnostic scan

    /// Full diagnostic scan: counts plus a bounded corrupted sample
    pub fn diagnose_corruption(&self) -> Result<ChainDiagnostic> {
        let stamp = self.acquire_read();
        self.diagnose_corruption_locked(stamp.token())
    }

    /// Caller-locked variant of [`Ledger::diagnose_corruption`]; the token proves the lock is held
    pub fn diagnose_corruption_locked(&self, _token: &ReadToken) -> Result<ChainDiagnostic> {
        self.diagnose_corruption_inner()
    }

    fn diagnose_corruption_inner(&self) -> Result<ChainDiagnostic> {
        let keys = self.store.authorized_keys()?;
        let scanner = ChainScanner::new(
            self.store.as_ref(),
            &keys,
            self.config.traversal.default_batch_size,
        );
        scanner.full_scan(self.config.recovery.corrupted_sample_limit)
    }

    /// Length of the valid prefix, count-only; caller holds the lock
    pub fn valid_prefix_locked(&self, _token: &ReadToken) -> Result<u64> {
        let keys = self.store.authorized_keys()?;
        let scanner = ChainScanner::new(
            self.store.as_ref(),
            &keys,
            self.config.traversal.default_batch_size,
        );
        scanner.valid_prefix_len()
    }

    /// Re-validate the inclusive sequence range; caller holds the lock
    pub fn validate_range_locked(&self, _token: &ReadToken, from: u64, to: u64) -> Result<bool> {
        let keys = self.store.authorized_keys()?;
        let scanner = ChainScanner::new(
            self.store.as_ref(),
            &keys,
            self.config.traversal.default_batch_size,
        );
        scanner.validate_range(from, to)
    }

    // Dual-mode: authorized-key listing

    /// All authorized keys, including revoked ones
    pub fn authorized_keys(&self) -> Result<Vec<AuthorizedKey>> {
        let stamp = self.acquire_read();
        self.authorized_keys_locked(stamp.token())
    }

    /// Caller-locked variant of [`Ledger::authorized_keys`]; the token proves the lock is held
    pub fn authorized_keys_locked(&self, _token: &ReadToken) -> Result<Vec<AuthorizedKey>> {
        self.authorized_keys_inner()
    }

    fn authorized_keys_inner(&self) -> Result<Vec<AuthorizedKey>> {
        self.store.authorized_keys()
    }

    // Dual-mode: authorized-key addition

    /// Add or replace an authorized key
    pub fn add_authorized_key(&self, key: AuthorizedKey) -> Result<()> {
        let stamp = self.acquire_write()?;
        self.add_authorized_key_locked(stamp.token(), key)
    }

    /// Caller-locked variant of [`Ledger::add_authorized_key`]; the token proves the lock is held
    pub fn add_authorized_key_locked(&self, _token: &WriteToken, key: AuthorizedKey) -> Result<()> {
        self.add_authorized_key_inner(key)
    }

    fn add_authorized_key_inner(&self, key: AuthorizedKey) -> Result<()> {
        tracing::debug!(key_id = %key.key_id, label = %key.label, "Authorized key added");
        self.store.put_authorized_key(&key)
    }

    // Dual-mode: authorized-key revocation

    /// Revoke an authorized key
    pub fn revoke_authorized_key(&self, key_id: Uuid) -> Result<()> {
        let stamp = self.acquire_write()?;
        self.revoke_authorized_key_locked(stamp.token(), key_id)
    }

    /// Caller-locked variant of [`Ledger::revoke_authorized_key`]; the token proves the lock is held
    pub fn revoke_authorized_key_locked(&self, _token: &WriteToken, key_id: Uuid) -> Result<()> {
        self.revoke_authorized_key_inner(key_id)
    }

    fn revoke_authorized_key_inner(&self, key_id: Uuid) -> Result<()> {
        let keys = self.store.authorized_keys()?;
        let mut key = keys
            .into_iter()
            .find(|k| k.key_id == key_id)
            .ok_or(Error::KeyNotFound(key_id))?;

        key.revoked = true;
        key.revoked_at = Some(Utc::now());
        self.store.put_authorized_key(&key)?;

        tracing::info!(key_id = %key_id, "Authorized key revoked");
        Ok(())
    }

    // Dual-mode: range rollback

    /// Truncate the chain after `sequence_number`; destructive, irreversible
    pub fn rollback_to(&self, sequence_number: u64) -> Result<u64> {
        let stamp = self.acquire_write()?;
        self.rollback_to_locked(stamp.token(), sequence_number)
    }

    /// Caller-locked variant of [`Ledger::rollback_to`]; the token proves the lock is held
    pub fn rollback_to_locked(&self, _token: &WriteToken, sequence_number: u64) -> Result<u64> {
        self.rollback_to_inner(sequence_number)
    }

    fn rollback_to_inner(&self, sequence_number: u64) -> Result<u64> {
        let removed = self.store.truncate_after(sequence_number)?;
        self.metrics.record_rollback(removed);

        tracing::info!(
            last_kept = sequence_number,
            removed,
            "Chain rolled back"
        );
        Ok(removed)
    }

    // Batch traversal

    /// Process the chain in ascending batches without holding any lock
    ///
    /// Consumers needing a consistent snapshot should instead take a read
    /// stamp and combine `_locked` calls with [`Ledger::process_in_batches_locked`].
    pub fn process_in_batches<F>(&self, batch_size: usize, consumer: F) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        let engine = BatchTraversal::new(self.store.as_ref(), self.clamp_batch(batch_size)?)?;
        engine.traverse(consumer)
    }

    /// Filtered batch processing; the filter is pushed down to storage
    pub fn process_filtered<F>(
        &self,
        filter: BlockFilter,
        batch_size: usize,
        consumer: F,
    ) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        let engine = BatchTraversal::new(self.store.as_ref(), self.clamp_batch(batch_size)?)?;
        engine.traverse_filtered(filter, consumer)
    }

    /// Batch processing under a caller-held read stamp (consistent snapshot)
    pub fn process_in_batches_locked<F>(
        &self,
        _token: &ReadToken,
        batch_size: usize,
        consumer: F,
    ) -> Result<TraversalSummary>
    where
        F: FnMut(&[Block]) -> Result<BatchControl>,
    {
        let engine = BatchTraversal::new(self.store.as_ref(), self.clamp_batch(batch_size)?)?;
        engine.traverse(consumer)
    }

    fn clamp_batch(&self, batch_size: usize) -> Result<usize> {
        if batch_size == 0 {
            return Err(Error::Config("Batch size must be positive".to_string()));
        }
        Ok(batch_size.min(self.config.traversal.max_batch_size))
    }

    // Export

    /// Export the chain to a JSON-lines file; returns the block count written
    ///
    /// Holds one read stamp across the traversal for a consistent snapshot;
    /// memory stays O(batch_size).
    pub fn export_chain(&self, path: impl AsRef<Path>) -> Result<u64> {
        let stamp = self.acquire_read();
        self.export_chain_locked(stamp.token(), path, None)
    }

    /// Caller-locked export of the prefix up to `up_to` (inclusive; None = all)
    ///
    /// Re-reads storage batch by batch; never reconstructs blocks from
    /// scan-accumulated state.
    pub fn export_chain_locked(
        &self,
        token: &ReadToken,
        path: impl AsRef<Path>,
        up_to: Option<u64>,
    ) -> Result<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);

        let mut written = 0u64;
        self.process_in_batches_locked(token, self.config.traversal.default_batch_size, |batch| {
            for block in batch {
                if let Some(limit) = up_to {
                    if block.sequence_number > limit {
                        return Ok(BatchControl::Stop);
                    }
                }
                let line = serde_json::to_string(block)
                    .map_err(|e| Error::Other(format!("Export serialization failed: {}", e)))?;
                writeln!(writer, "{}", line)?;
                written += 1;
            }
            Ok(BatchControl::Continue)
        })?;
        writer.flush()?;

        tracing::info!(path = %path.display(), blocks = written, "Chain exported");
        Ok(written)
    }

    // Recovery

    /// Diagnose and attempt to recover a corrupted chain
    ///
    /// Runs the recovery state machine inside one write critical section.
    /// Internal failures are downgraded to a failed [`RecoveryResult`];
    /// only lock-acquisition timeout surfaces as an error.
    pub fn recover_corrupted_chain(&self, signer_key_id: Option<Uuid>) -> Result<RecoveryResult> {
        let stamp = self.acquire_write()?;
        self.metrics.record_recovery_attempt();

        let manager = RecoveryManager::new(self, &self.config.recovery);
        Ok(manager.recover(stamp.token(), signer_key_id))
    }
}
