//! Core types for the hash-chained ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Immutability after append (blocks are never mutated, only truncated)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One immutable, signed record plus chain-linkage metadata
///
/// `block_hash` is a pure function of the other fields; for every block with
/// `sequence_number > 0`, `previous_hash` equals the predecessor's
/// `block_hash`. Blocks are created and content-hashed outside the write
/// lock, persisted exactly once inside it, and removed only by tail
/// truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Monotonic sequence number (0 = genesis)
    pub sequence_number: u64,

    /// Hash of the previous block (all zeroes for genesis)
    pub previous_hash: [u8; 32],

    /// SHA-256 of the block content
    pub content_hash: [u8; 32],

    /// Hash of this block's fields (computed by [`Block::compute_hash`])
    pub block_hash: [u8; 32],

    /// Record payload (opaque; may be ciphertext)
    pub content: Vec<u8>,

    /// Whether `content` is encrypted
    pub encrypted: bool,

    /// Pointer to a large payload stored off-chain
    pub off_chain: Option<OffChainRef>,

    /// Append timestamp
    pub timestamp: DateTime<Utc>,

    /// Identity of the signing key
    pub signer_key_id: Uuid,

    /// Ed25519 signature over `block_hash`
    pub signature: Signature,
}

impl Block {
    /// Compute block hash from chain-linkage fields
    ///
    /// The signature is excluded: it is computed over this hash.
    pub fn compute_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.sequence_number.to_be_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.content_hash);
        hasher.update([self.encrypted as u8]);
        if let Some(ref off_chain) = self.off_chain {
            hasher.update(off_chain.uri.as_bytes());
            hasher.update(off_chain.content_hash);
        }
        hasher.update(
            self.timestamp
                .timestamp_nanos_opt()
                .unwrap_or(0)
                .to_be_bytes(),
        );
        hasher.update(self.signer_key_id.as_bytes());

        hasher.finalize().into()
    }

    /// Deterministic row encoding for storage implementations
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a block from its row encoding
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Pointer to a payload stored outside the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffChainRef {
    /// Location of the payload (file path, object-store URI, ...)
    pub uri: String,

    /// SHA-256 of the off-chain payload
    pub content_hash: [u8; 32],
}

/// A permitted signer with validity interval and revocation state
///
/// Mutated only under the write lock; read under the read lock or
/// optimistically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedKey {
    /// Key identity referenced by blocks
    pub key_id: Uuid,

    /// Ed25519 public key
    pub public_key: [u8; 32],

    /// Human-readable owner label
    pub label: String,

    /// Start of the validity interval
    pub valid_from: DateTime<Utc>,

    /// End of the validity interval (open-ended if absent)
    pub valid_until: Option<DateTime<Utc>>,

    /// Revocation flag
    pub revoked: bool,

    /// When the key was revoked
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AuthorizedKey {
    /// Create an unrevoked key valid from now, open-ended
    pub fn new(key_id: Uuid, public_key: [u8; 32], label: impl Into<String>) -> Self {
        Self {
            key_id,
            public_key,
            label: label.into(),
            valid_from: Utc::now(),
            valid_until: None,
            revoked: false,
            revoked_at: None,
        }
    }

    /// Whether this key may sign at `at`
    pub fn usable_at(&self, at: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        if at < self.valid_from {
            return false;
        }
        match self.valid_until {
            Some(until) => at <= until,
            None => true,
        }
    }
}

/// Validation outcome for a single block
///
/// Threaded through scans instead of exceptions: corruption is expected
/// input to recovery, not a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockValidity {
    /// Block is intact and correctly linked
    Valid,
    /// Block failed validation
    Corrupted {
        /// Why validation failed
        reason: CorruptionReason,
    },
    /// Validation could not be completed (e.g. storage failed mid-scan)
    Unknown,
}

impl BlockValidity {
    /// True for [`BlockValidity::Valid`]
    pub fn is_valid(&self) -> bool {
        matches!(self, BlockValidity::Valid)
    }
}

/// Why a block failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorruptionReason {
    /// Recomputed hash differs from the stored block hash
    HashMismatch,
    /// `previous_hash` does not match the predecessor's block hash
    BrokenLink,
    /// Signer key id is not in the authorized set
    UnknownSigner,
    /// Signer key was revoked
    RevokedSigner,
    /// Block timestamp falls outside the signer key's validity interval
    KeyOutsideValidity,
    /// Ed25519 signature does not verify
    InvalidSignature,
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CorruptionReason::HashMismatch => "hash mismatch",
            CorruptionReason::BrokenLink => "broken predecessor link",
            CorruptionReason::UnknownSigner => "unknown signer",
            CorruptionReason::RevokedSigner => "revoked signer",
            CorruptionReason::KeyOutsideValidity => "signer key outside validity window",
            CorruptionReason::InvalidSignature => "invalid signature",
        };
        write!(f, "{}", s)
    }
}

/// Reference to one corrupted block inside a diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptedRef {
    /// Sequence number of the corrupted block
    pub sequence_number: u64,
    /// Validation failure reason
    pub reason: CorruptionReason,
}

/// Result of a quick (stop-at-first-corruption) chain scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Total blocks in the chain
    pub total_blocks: u64,
    /// Blocks validated before the scan stopped
    pub valid_blocks: u64,
    /// First corrupted sequence number, if any
    pub first_corrupted: Option<u64>,
}

impl ValidationReport {
    /// True when the whole chain validated
    pub fn ok(&self) -> bool {
        self.first_corrupted.is_none() && self.valid_blocks == self.total_blocks
    }
}

/// Ephemeral result of a full diagnostic scan
///
/// Holds counts plus a bounded sample of corrupted references, never the
/// full corrupted set. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDiagnostic {
    /// Total blocks scanned
    pub total_blocks: u64,
    /// Blocks that validated
    pub valid_blocks: u64,
    /// Blocks that failed validation
    pub corrupted_blocks: u64,
    /// Lowest corrupted sequence number, if any
    pub first_corrupted: Option<u64>,
    /// Bounded sample of corrupted references
    pub samples: Vec<CorruptedRef>,
    /// When the scan ran
    pub scanned_at: DateTime<Utc>,
}

impl ChainDiagnostic {
    /// True when no corruption was found
    pub fn healthy(&self) -> bool {
        self.corrupted_blocks == 0
    }
}

/// Strategy a recovery attempt ended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Chain was already healthy; nothing to do
    NoneNeeded,
    /// Revoked signer re-added and the affected range re-validated
    Reauthorize,
    /// Tail truncated to the last known-valid sequence number
    Rollback,
    /// Valid prefix exported to a backup file
    ExportPartial,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::NoneNeeded => "none-needed",
            RecoveryStrategy::Reauthorize => "reauthorize",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::ExportPartial => "export-partial",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a recovery attempt; ephemeral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Whether the chain ended in a consistent, recovered state
    pub success: bool,
    /// Strategy the attempt ended on
    pub strategy: RecoveryStrategy,
    /// Human-readable outcome description
    pub message: String,
}

impl RecoveryResult {
    /// Successful outcome
    pub fn succeeded(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy,
            message: message.into(),
        }
    }

    /// Failed outcome
    pub fn failed(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy,
            message: message.into(),
        }
    }
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let signature = DalekSignature::from_bytes(&self.bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block() -> Block {
        let mut block = Block {
            sequence_number: 0,
            previous_hash: [0u8; 32],
            content_hash: [7u8; 32],
            block_hash: [0u8; 32],
            content: b"hello".to_vec(),
            encrypted: false,
            off_chain: None,
            timestamp: Utc::now(),
            signer_key_id: Uuid::new_v4(),
            signature: Signature::from_bytes([0u8; 64]),
        };
        block.block_hash = block.compute_hash();
        block
    }

    #[test]
    fn test_block_hash_deterministic() {
        let block = test_block();
        assert_eq!(block.compute_hash(), block.compute_hash());
    }

    #[test]
    fn test_block_hash_covers_linkage() {
        let block = test_block();
        let mut tampered = block.clone();
        tampered.previous_hash = [9u8; 32];
        assert_ne!(block.compute_hash(), tampered.compute_hash());

        let mut tampered = block.clone();
        tampered.sequence_number = 42;
        assert_ne!(block.compute_hash(), tampered.compute_hash());
    }

    #[test]
    fn test_row_encoding_roundtrip() {
        let block = test_block();
        let bytes = block.to_bytes().unwrap();
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.sequence_number, block.sequence_number);
        assert_eq!(decoded.block_hash, block.block_hash);
        assert_eq!(decoded.content, block.content);
    }

    #[test]
    fn test_block_hash_excludes_signature() {
        let block = test_block();
        let mut resigned = block.clone();
        resigned.signature = Signature::from_bytes([1u8; 64]);
        assert_eq!(block.compute_hash(), resigned.compute_hash());
    }

    #[test]
    fn test_authorized_key_validity_window() {
        let mut key = AuthorizedKey::new(Uuid::new_v4(), [0u8; 32], "ops");
        let now = Utc::now();
        assert!(key.usable_at(now));

        // Before the window opens
        assert!(!key.usable_at(key.valid_from - chrono::Duration::seconds(1)));

        // After the window closes
        key.valid_until = Some(now);
        assert!(!key.usable_at(now + chrono::Duration::seconds(1)));

        // Revoked keys are never usable
        key.valid_until = None;
        key.revoked = true;
        assert!(!key.usable_at(now));
    }

    #[test]
    fn test_validation_report_ok() {
        let report = ValidationReport {
            total_blocks: 5,
            valid_blocks: 5,
            first_corrupted: None,
        };
        assert!(report.ok());

        let report = ValidationReport {
            total_blocks: 5,
            valid_blocks: 3,
            first_corrupted: Some(3),
        };
        assert!(!report.ok());
    }
}
