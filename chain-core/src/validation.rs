//! Block and chain validation
//!
//! Validation outcomes are values ([`BlockValidity`]), threaded through
//! scans instead of errors: corruption is expected input to recovery and
//! must never crash the read path. Two chain-level scans exist with
//! different cost profiles: a quick scan stopping at the first corruption
//! and a full diagnostic scan visiting everything.

use crate::crypto::{hash_bytes, verify_block_signature};
use crate::store::BlockStore;
use crate::traversal::{BatchControl, BatchTraversal};
use crate::types::{
    AuthorizedKey, Block, BlockValidity, ChainDiagnostic, CorruptedRef, CorruptionReason,
    ValidationReport,
};
use crate::Result;
use chrono::Utc;

/// Validate a single block against its predecessor hash and the key set
///
/// `previous_hash` is `None` only for genesis. Checks, in order: content
/// hash, block hash, predecessor link, signer authorization (unknown,
/// revoked, validity window), signature.
pub fn validate_block(
    block: &Block,
    previous_hash: Option<&[u8; 32]>,
    keys: &[AuthorizedKey],
) -> BlockValidity {
    // Content hash only binds inline payloads; off-chain payloads carry
    // their own hash inside the reference.
    if block.off_chain.is_none() && hash_bytes(&block.content) != block.content_hash {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::HashMismatch,
        };
    }

    if block.compute_hash() != block.block_hash {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::HashMismatch,
        };
    }

    let link_ok = match previous_hash {
        Some(prev) => block.previous_hash == *prev,
        None => block.sequence_number == 0 && block.previous_hash == [0u8; 32],
    };
    if !link_ok {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::BrokenLink,
        };
    }

    let key = match keys.iter().find(|k| k.key_id == block.signer_key_id) {
        Some(key) => key,
        None => {
            return BlockValidity::Corrupted {
                reason: CorruptionReason::UnknownSigner,
            }
        }
    };

    if key.revoked {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::RevokedSigner,
        };
    }

    if !key.usable_at(block.timestamp) {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::KeyOutsideValidity,
        };
    }

    if !verify_block_signature(block, &key.public_key) {
        return BlockValidity::Corrupted {
            reason: CorruptionReason::InvalidSignature,
        };
    }

    BlockValidity::Valid
}

/// Chain-level scans driving the batch traversal engine
///
/// The scanner never touches the sequence lock; callers hold whatever stamp
/// their consistency needs dictate.
pub struct ChainScanner<'a> {
    store: &'a dyn BlockStore,
    keys: &'a [AuthorizedKey],
    batch_size: usize,
}

impl<'a> ChainScanner<'a> {
    /// Scanner over `store` with the given key set and page size
    pub fn new(store: &'a dyn BlockStore, keys: &'a [AuthorizedKey], batch_size: usize) -> Self {
        Self {
            store,
            keys,
            batch_size,
        }
    }

    /// Quick scan: stop at the first corrupted block
    pub fn quick_scan(&self) -> Result<ValidationReport> {
        let total_blocks = self.store.block_count()?;
        let mut valid_blocks = 0u64;
        let mut first_corrupted = None;
        let mut prev_hash: Option<[u8; 32]> = None;

        let engine = BatchTraversal::new(self.store, self.batch_size)?;
        engine.traverse(|batch| {
            for block in batch {
                match validate_block(block, prev_hash.as_ref(), self.keys) {
                    BlockValidity::Valid => valid_blocks += 1,
                    _ => {
                        first_corrupted = Some(block.sequence_number);
                        return Ok(BatchControl::Stop);
                    }
                }
                prev_hash = Some(block.block_hash);
            }
            Ok(BatchControl::Continue)
        })?;

        Ok(ValidationReport {
            total_blocks,
            valid_blocks,
            first_corrupted,
        })
    }

    /// Full diagnostic scan: visit everything, keep a bounded sample
    pub fn full_scan(&self, sample_limit: usize) -> Result<ChainDiagnostic> {
        let mut total_blocks = 0u64;
        let mut valid_blocks = 0u64;
        let mut corrupted_blocks = 0u64;
        let mut first_corrupted = None;
        let mut samples = Vec::new();
        let mut prev_hash: Option<[u8; 32]> = None;

        let engine = BatchTraversal::new(self.store, self.batch_size)?;
        engine.traverse(|batch| {
            for block in batch {
                total_blocks += 1;
                match validate_block(block, prev_hash.as_ref(), self.keys) {
                    BlockValidity::Valid => valid_blocks += 1,
                    BlockValidity::Corrupted { reason } => {
                        corrupted_blocks += 1;
                        if first_corrupted.is_none() {
                            first_corrupted = Some(block.sequence_number);
                        }
                        if samples.len() < sample_limit {
                            samples.push(CorruptedRef {
                                sequence_number: block.sequence_number,
                                reason,
                            });
                        }
                    }
                    BlockValidity::Unknown => {
                        corrupted_blocks += 1;
                        if first_corrupted.is_none() {
                            first_corrupted = Some(block.sequence_number);
                        }
                    }
                }
                prev_hash = Some(block.block_hash);
            }
            Ok(BatchControl::Continue)
        })?;

        Ok(ChainDiagnostic {
            total_blocks,
            valid_blocks,
            corrupted_blocks,
            first_corrupted,
            samples,
            scanned_at: Utc::now(),
        })
    }

    /// Length of the valid prefix, count-only
    ///
    /// Never materializes the prefix; recovery uses this before invoking the
    /// storage-re-reading export.
    pub fn valid_prefix_len(&self) -> Result<u64> {
        let report = self.quick_scan()?;
        Ok(report.valid_blocks)
    }

    /// Re-validate the inclusive range `[from, to]`
    ///
    /// Used after reauthorization to confirm the affected range healed.
    pub fn validate_range(&self, from: u64, to: u64) -> Result<bool> {
        let mut prev_hash: Option<[u8; 32]> = if from == 0 {
            None
        } else {
            match self.store.block_by_number(from - 1)? {
                Some(prev) => Some(prev.block_hash),
                None => return Ok(false),
            }
        };

        let mut seq = from;
        while seq <= to {
            let limit = self.batch_size.min((to - seq + 1) as usize);
            let page = self.store.blocks_paginated(seq, limit)?;
            if page.is_empty() {
                return Ok(false);
            }
            for block in &page {
                if block.sequence_number > to {
                    return Ok(true);
                }
                if !validate_block(block, prev_hash.as_ref(), self.keys).is_valid() {
                    return Ok(false);
                }
                prev_hash = Some(block.block_hash);
                seq = block.sequence_number + 1;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::store::MemoryStore;
    use crate::types::Signature;
    use uuid::Uuid;

    struct Fixture {
        store: MemoryStore,
        keys: Vec<AuthorizedKey>,
    }

    fn build_chain(len: u64) -> Fixture {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let key_id = Uuid::new_v4();
        let mut authorized = AuthorizedKey::new(key_id, keypair.public_key(), "signer");
        authorized.valid_from = Utc::now() - chrono::Duration::hours(1);

        let store = MemoryStore::new();
        let mut prev_hash = [0u8; 32];
        for seq in 0..len {
            let content = format!("entry-{}", seq).into_bytes();
            let mut block = Block {
                sequence_number: seq,
                previous_hash: prev_hash,
                content_hash: hash_bytes(&content),
                block_hash: [0u8; 32],
                content,
                encrypted: false,
                off_chain: None,
                timestamp: Utc::now(),
                signer_key_id: key_id,
                signature: Signature::from_bytes([0u8; 64]),
            };
            block.block_hash = block.compute_hash();
            block.signature = keypair.sign(&block.block_hash);
            prev_hash = block.block_hash;
            store.append_block(&block).unwrap();
        }

        Fixture {
            store,
            keys: vec![authorized],
        }
    }

    #[test]
    fn test_valid_chain_quick_scan() {
        let fx = build_chain(12);
        let scanner = ChainScanner::new(&fx.store, &fx.keys, 5);
        let report = scanner.quick_scan().unwrap();
        assert!(report.ok());
        assert_eq!(report.valid_blocks, 12);
    }

    #[test]
    fn test_tampered_content_detected() {
        let fx = build_chain(6);
        let mut victim = fx.store.block_by_number(3).unwrap().unwrap();
        victim.content = b"tampered".to_vec();
        fx.store.truncate_after(2).unwrap();
        fx.store.append_block(&victim).unwrap();

        let scanner = ChainScanner::new(&fx.store, &fx.keys, 4);
        let report = scanner.quick_scan().unwrap();
        assert_eq!(report.first_corrupted, Some(3));
        assert_eq!(report.valid_blocks, 3);
    }

    #[test]
    fn test_revoked_signer_detected() {
        let fx = build_chain(5);
        let mut keys = fx.keys.clone();
        keys[0].revoked = true;
        keys[0].revoked_at = Some(Utc::now());

        let block = fx.store.block_by_number(0).unwrap().unwrap();
        let validity = validate_block(&block, None, &keys);
        assert_eq!(
            validity,
            BlockValidity::Corrupted {
                reason: CorruptionReason::RevokedSigner
            }
        );
    }

    #[test]
    fn test_unknown_signer_detected() {
        let fx = build_chain(1);
        let block = fx.store.block_by_number(0).unwrap().unwrap();
        let validity = validate_block(&block, None, &[]);
        assert_eq!(
            validity,
            BlockValidity::Corrupted {
                reason: CorruptionReason::UnknownSigner
            }
        );
    }

    #[test]
    fn test_forged_signature_detected() {
        let fx = build_chain(2);
        let mut block = fx.store.block_by_number(1).unwrap().unwrap();
        let forger = KeyPair::generate();
        block.signature = forger.sign(&block.block_hash);

        let genesis = fx.store.block_by_number(0).unwrap().unwrap();
        let validity = validate_block(&block, Some(&genesis.block_hash), &fx.keys);
        assert_eq!(
            validity,
            BlockValidity::Corrupted {
                reason: CorruptionReason::InvalidSignature
            }
        );
    }

    #[test]
    fn test_broken_link_detected() {
        let fx = build_chain(3);
        let block = fx.store.block_by_number(2).unwrap().unwrap();
        let wrong_prev = [9u8; 32];
        let validity = validate_block(&block, Some(&wrong_prev), &fx.keys);
        assert_eq!(
            validity,
            BlockValidity::Corrupted {
                reason: CorruptionReason::BrokenLink
            }
        );
    }

    #[test]
    fn test_full_scan_counts_and_samples() {
        let fx = build_chain(10);

        // Corrupt two blocks by re-signing with a different key
        let forger = KeyPair::generate();
        for seq in [4u64, 7u64] {
            let mut block = fx.store.block_by_number(seq).unwrap().unwrap();
            block.signature = forger.sign(&block.block_hash);
            let tail: Vec<Block> = (seq + 1..10)
                .filter_map(|s| fx.store.block_by_number(s).unwrap())
                .collect();
            fx.store.truncate_after(seq.saturating_sub(1)).unwrap();
            fx.store.append_block(&block).unwrap();
            for b in tail {
                fx.store.append_block(&b).unwrap();
            }
        }

        let scanner = ChainScanner::new(&fx.store, &fx.keys, 3);
        let diag = scanner.full_scan(1).unwrap();
        assert_eq!(diag.total_blocks, 10);
        assert_eq!(diag.corrupted_blocks, 2);
        assert_eq!(diag.valid_blocks, 8);
        assert_eq!(diag.first_corrupted, Some(4));
        // Sample stays bounded below the corrupted count
        assert_eq!(diag.samples.len(), 1);
        assert!(!diag.healthy());
    }

    #[test]
    fn test_validate_range_heals_after_key_restored() {
        let fx = build_chain(8);
        let mut keys = fx.keys.clone();
        keys[0].revoked = true;

        let scanner = ChainScanner::new(&fx.store, &keys, 4);
        assert!(!scanner.validate_range(2, 6).unwrap());

        keys[0].revoked = false;
        let scanner = ChainScanner::new(&fx.store, &keys, 4);
        assert!(scanner.validate_range(2, 6).unwrap());
    }

    #[test]
    fn test_valid_prefix_len() {
        let fx = build_chain(9);
        let forger = KeyPair::generate();
        let mut block = fx.store.block_by_number(6).unwrap().unwrap();
        block.signature = forger.sign(&block.block_hash);
        let tail: Vec<Block> = (7..9)
            .filter_map(|s| fx.store.block_by_number(s).unwrap())
            .collect();
        fx.store.truncate_after(5).unwrap();
        fx.store.append_block(&block).unwrap();
        for b in tail {
            fx.store.append_block(&b).unwrap();
        }

        let scanner = ChainScanner::new(&fx.store, &fx.keys, 4);
        assert_eq!(scanner.valid_prefix_len().unwrap(), 6);
    }
}
