//! Chain recovery state machine
//!
//! Diagnoses corruption and attempts, in order: signer reauthorization,
//! tail rollback, valid-prefix export. Always entered while the caller
//! holds the write lock; every callback into the ledger goes through the
//! `_locked` variants with the caller's token, so the recovery/facade call
//! graph never touches the non-reentrant lock.
//!
//! Errors inside recovery are caught, logged and downgraded to a failed
//! [`RecoveryResult`] — recovery never surfaces an unhandled failure, and a
//! failed attempt leaves the chain in its last consistent state.

use crate::config::RecoveryConfig;
use crate::ledger::Ledger;
use crate::lock::WriteToken;
use crate::types::{
    AuthorizedKey, ChainDiagnostic, CorruptionReason, RecoveryResult, RecoveryStrategy,
};
use crate::Result;
use uuid::Uuid;

/// Phases of a recovery attempt
#[derive(Debug, Clone, Copy)]
enum Phase {
    Scanning,
    Reauthorizing,
    RollingBack,
    ExportingPartial,
}

/// Drives one recovery attempt inside the caller's write critical section
pub struct RecoveryManager<'a> {
    ledger: &'a Ledger,
    config: &'a RecoveryConfig,
}

impl<'a> RecoveryManager<'a> {
    /// Manager bound to one ledger instance and its recovery settings
    pub fn new(ledger: &'a Ledger, config: &'a RecoveryConfig) -> Self {
        Self { ledger, config }
    }

    /// Run the state machine; never returns an error
    pub fn recover(&self, token: &WriteToken, signer_key_id: Option<Uuid>) -> RecoveryResult {
        match self.run(token, signer_key_id) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "Recovery attempt failed; chain left unchanged");
                RecoveryResult::failed(
                    RecoveryStrategy::NoneNeeded,
                    format!("Recovery aborted: {}", err),
                )
            }
        }
    }

    fn run(&self, token: &WriteToken, signer_key_id: Option<Uuid>) -> Result<RecoveryResult> {
        let diagnostic = self.ledger.diagnose_corruption_locked(token.as_read())?;
        tracing::info!(
            total = diagnostic.total_blocks,
            corrupted = diagnostic.corrupted_blocks,
            first_corrupted = ?diagnostic.first_corrupted,
            "Recovery scan complete"
        );

        let mut phase = Phase::Scanning;
        loop {
            phase = match phase {
                Phase::Scanning => {
                    if diagnostic.healthy() {
                        return Ok(RecoveryResult::succeeded(
                            RecoveryStrategy::NoneNeeded,
                            "Chain is healthy; no recovery needed",
                        ));
                    }
                    Phase::Reauthorizing
                }

                Phase::Reauthorizing => {
                    match self.try_reauthorize(token, &diagnostic, signer_key_id)? {
                        Some(result) => return Ok(result),
                        None => Phase::RollingBack,
                    }
                }

                Phase::RollingBack => match self.try_rollback(token, &diagnostic)? {
                    Some(result) => return Ok(result),
                    None => Phase::ExportingPartial,
                },

                Phase::ExportingPartial => return self.export_partial(token),
            };
        }
    }

    /// Reauthorization applies when every sampled corruption traces to a
    /// revoked signer and the caller named that key
    fn try_reauthorize(
        &self,
        token: &WriteToken,
        diagnostic: &ChainDiagnostic,
        signer_key_id: Option<Uuid>,
    ) -> Result<Option<RecoveryResult>> {
        let key_id = match signer_key_id {
            Some(id) => id,
            None => return Ok(None),
        };

        let revoked_only = !diagnostic.samples.is_empty()
            && diagnostic
                .samples
                .iter()
                .all(|s| s.reason == CorruptionReason::RevokedSigner);
        if !revoked_only {
            return Ok(None);
        }

        let keys = self.ledger.authorized_keys_locked(token.as_read())?;
        let original = match keys.iter().find(|k| k.key_id == key_id && k.revoked) {
            Some(key) => key.clone(),
            None => return Ok(None),
        };

        tracing::info!(key_id = %key_id, "Attempting signer reauthorization");
        let restored = AuthorizedKey {
            revoked: false,
            revoked_at: None,
            ..original.clone()
        };
        self.ledger.add_authorized_key_locked(token, restored)?;

        // Only the range the scan flagged needs re-checking; the prefix
        // before it was already judged valid
        let from = diagnostic.first_corrupted.unwrap_or(0);
        let to = diagnostic.total_blocks.saturating_sub(1);
        let healed = self
            .ledger
            .validate_range_locked(token.as_read(), from, to)?;
        if healed {
            return Ok(Some(RecoveryResult::succeeded(
                RecoveryStrategy::Reauthorize,
                format!("Reauthorized signer {} and re-validated the chain", key_id),
            )));
        }

        // Reauthorization did not heal the chain; undo the grant
        self.ledger.add_authorized_key_locked(token, original)?;
        tracing::warn!(key_id = %key_id, "Reauthorization did not heal the chain; reverted");
        Ok(None)
    }

    /// Rollback applies when a non-empty valid prefix exists and config
    /// permits destructive recovery
    fn try_rollback(
        &self,
        token: &WriteToken,
        diagnostic: &ChainDiagnostic,
    ) -> Result<Option<RecoveryResult>> {
        if !self.config.allow_rollback {
            return Ok(None);
        }

        let first_corrupted = match diagnostic.first_corrupted {
            Some(seq) => seq,
            None => return Ok(None),
        };
        if first_corrupted == 0 {
            // Genesis is corrupted; nothing to keep
            return Ok(None);
        }

        let last_valid = first_corrupted - 1;
        let removed = self.ledger.rollback_to_locked(token, last_valid)?;

        let report = self.ledger.validate_chain_locked(token.as_read())?;
        if report.ok() {
            return Ok(Some(RecoveryResult::succeeded(
                RecoveryStrategy::Rollback,
                format!(
                    "Rolled back {} blocks; chain ends at sequence {}",
                    removed, last_valid
                ),
            )));
        }

        // Truncation did not yield a valid chain (corruption was not a pure
        // suffix problem); the export path still applies
        tracing::warn!(last_valid, "Rollback left residual corruption");
        Ok(None)
    }

    /// Export the valid prefix without materializing scan state
    fn export_partial(&self, token: &WriteToken) -> Result<RecoveryResult> {
        // Count-only prefix measurement, then an independent export that
        // re-reads storage batch by batch
        let prefix_len = self.ledger.valid_prefix_locked(token.as_read())?;
        if prefix_len == 0 {
            return Ok(RecoveryResult::failed(
                RecoveryStrategy::ExportPartial,
                "No valid prefix to export; chain left in its last consistent state",
            ));
        }

        let file_name = format!(
            "chain-recovery-{}.jsonl",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.config.export_dir.join(file_name);

        let exported =
            self.ledger
                .export_chain_locked(token.as_read(), &path, Some(prefix_len - 1))?;

        Ok(RecoveryResult::succeeded(
            RecoveryStrategy::ExportPartial,
            format!(
                "Exported {} valid blocks to {}; corrupted tail left in place",
                exported,
                path.display()
            ),
        ))
    }
}
