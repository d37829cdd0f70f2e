//! ChainVault Chain Core
//!
//! Concurrency-control and recovery core of an append-only, hash-chained
//! ledger.
//!
//! # Architecture
//!
//! - **Sequence Lock**: One write/read/optimistic lock guards all chain state
//! - **Dual-Mode Operations**: Every lock-sensitive operation has a public
//!   self-locking form and a `_locked` form taking a capability token
//! - **Batch Traversal**: Chain scans run in bounded-memory pages
//! - **Value-Typed Validation**: Corruption is data ([`BlockValidity`]),
//!   not an error path
//! - **Recovery State Machine**: Reauthorize, roll back, or export the
//!   valid prefix, inside one write critical section
//!
//! # Invariants
//!
//! - Append-only: blocks are never modified; removal only via rollback
//! - Hash chain: `block[n].previous_hash == block[n-1].block_hash`
//! - Single writer: at most one thread inside a write critical section
//! - Every lock acquisition is released on all exit paths (RAII stamps)

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod recovery;
pub mod store;
pub mod traversal;
pub mod types;
pub mod validation;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{AppendOptions, Ledger};
pub use lock::{OptimisticStamp, ReadStamp, ReadToken, SequenceLock, WriteStamp, WriteToken};
pub use store::{BlockFilter, BlockStore, MemoryStore};
pub use traversal::{BatchControl, BatchTraversal, TraversalSummary};
pub use types::{
    AuthorizedKey, Block, BlockValidity, ChainDiagnostic, CorruptionReason, RecoveryResult,
    RecoveryStrategy, Signature, ValidationReport,
};
