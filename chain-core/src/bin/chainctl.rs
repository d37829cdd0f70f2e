//! Chain core demo and diagnostics tool
//!
//! Builds an in-memory ledger, appends a few blocks, runs validation and a
//! recovery pass, and prints the results. Useful for smoke-testing the
//! concurrency core and for exercising the recovery paths by hand.

use chain_core::crypto::KeyPair;
use chain_core::{AuthorizedKey, Config, Ledger};
use tracing::info;
use uuid::Uuid;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Chain core demo starting...");

    let config = Config::from_env()?;
    let ledger = Ledger::in_memory(config);

    // Seed one authorized signer
    let signer = KeyPair::generate();
    let key_id = Uuid::new_v4();
    let mut key = AuthorizedKey::new(key_id, signer.public_key(), "chainctl-demo");
    key.valid_from = chrono::Utc::now() - chrono::Duration::minutes(1);
    ledger.add_authorized_key(key)?;

    // Append a short chain
    for i in 0..10u32 {
        let block = ledger.append_block(format!("demo-record-{}", i).into_bytes(), &signer)?;
        info!(
            sequence = block.sequence_number,
            hash = %hex_prefix(&block.block_hash),
            "Appended block"
        );
    }

    let report = ledger.validate_chain()?;
    info!(
        total = report.total_blocks,
        valid = report.valid_blocks,
        ok = report.ok(),
        "Chain validated"
    );

    // Demonstrate corruption handling: revoke the signer, diagnose, recover
    ledger.revoke_authorized_key(key_id)?;
    let diagnostic = ledger.diagnose_corruption()?;
    info!(
        corrupted = diagnostic.corrupted_blocks,
        first = ?diagnostic.first_corrupted,
        "Diagnosis after revocation"
    );

    let result = ledger.recover_corrupted_chain(Some(key_id))?;
    info!(
        success = result.success,
        strategy = %result.strategy,
        message = %result.message,
        "Recovery finished"
    );

    let report = ledger.validate_chain()?;
    info!(
        total = report.total_blocks,
        valid = report.valid_blocks,
        ok = report.ok(),
        "Final state"
    );

    Ok(())
}

fn hex_prefix(hash: &[u8; 32]) -> String {
    hash.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
