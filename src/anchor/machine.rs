/// Anchor state machine.
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use tracing::{debug, error, info, warn};

use super::{AnchorOutcome, DigestOwnership};
use crate::chain::{tx_ref, ChainClient, ChainError};
use crate::digest::Digest;
use crate::error::{ProofError, Result};
use crate::ledger::{LocalLedger, ProofRecord, ProofStatus};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct AnchorConfig {
    /// How long one `anchor` call waits for a receipt.
    pub receipt_timeout: Duration,
    /// Retry policy for transient submission failures.
    pub submission_retry: RetryPolicy,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            receipt_timeout: Duration::from_secs(120),
            submission_retry: RetryPolicy::submission(),
        }
    }
}

/// Drives ledger records through `pending → submitted → confirmed | failed`.
pub struct Anchorer {
    ledger: LocalLedger,
    chain: Option<Arc<ChainClient>>,
    ownership: Arc<DigestOwnership>,
    config: AnchorConfig,
}

impl Anchorer {
    pub fn new(
        ledger: LocalLedger,
        chain: Option<Arc<ChainClient>>,
        ownership: Arc<DigestOwnership>,
        config: AnchorConfig,
    ) -> Self {
        Self {
            ledger,
            chain,
            ownership,
            config,
        }
    }

    /// Anchor the stored record for `digest`.
    ///
    /// Safe to call repeatedly: a confirmed digest is returned untouched, an
    /// outstanding transaction is awaited rather than duplicated, and a
    /// failed transaction that landed after all is repaired to confirmed.
    /// Chain problems come back as outcomes; only ledger problems and an
    /// unknown digest are errors.
    pub async fn anchor(&self, digest: &Digest) -> Result<AnchorOutcome> {
        let _owner = self.ownership.acquire(*digest).await;

        let mut record = self
            .ledger
            .get(digest)
            .await?
            .ok_or_else(|| ProofError::NotFound(digest.to_hex()))?;

        match (record.status, record.chain_tx) {
            (ProofStatus::Confirmed, _) => {
                debug!(digest = %digest, "Digest already confirmed");
                return Ok(AnchorOutcome::AlreadyConfirmed(record));
            }
            (ProofStatus::Submitted, Some(tx_hash)) => {
                let Some(chain) = &self.chain else {
                    return Ok(AnchorOutcome::Submitted(record));
                };
                info!(digest = %digest, tx_hash = %tx_ref(&tx_hash), "Resuming wait on outstanding transaction");
                return self.await_confirmation(chain, record, tx_hash).await;
            }
            (ProofStatus::Failed, Some(tx_hash)) => {
                if let Some(chain) = &self.chain {
                    if let Some(outcome) = self.settle_earlier(chain, &mut record, tx_hash).await? {
                        return Ok(outcome);
                    }
                }
            }
            _ => {}
        }

        let chain = match &self.chain {
            Some(chain) if chain.can_sign() => chain,
            _ => return self.keep_local(record).await,
        };

        if matches!(record.status, ProofStatus::Failed | ProofStatus::LocalOnly) {
            record.reset_pending()?;
            self.ledger.put(&record).await?;
        }

        self.submit(chain, record).await
    }

    /// Settle a failed record's earlier transaction before a fresh attempt.
    ///
    /// A transaction that confirmed after all is promoted. One the node
    /// still holds is left to land on its own instead of being joined by a
    /// second. `None` means the earlier transaction is gone or reverted and a
    /// new one may be sent.
    async fn settle_earlier(
        &self,
        chain: &ChainClient,
        record: &mut ProofRecord,
        tx_hash: TxHash,
    ) -> Result<Option<AnchorOutcome>> {
        let receipt = match chain.transaction_receipt(&tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(digest = %record.digest, error = %e, "Could not check earlier transaction");
                return Ok(Some(AnchorOutcome::Failed(record.clone())));
            }
        };

        match receipt {
            Some(receipt) if receipt.success => {
                record.mark_confirmed(&receipt)?;
                self.ledger.put(record).await?;
                info!(
                    digest = %record.digest,
                    tx_hash = %tx_ref(&tx_hash),
                    block = receipt.block_number,
                    "Earlier transaction confirmed, record repaired"
                );
                Ok(Some(AnchorOutcome::Confirmed(record.clone())))
            }
            Some(_) => Ok(None),
            None => match chain.transaction_known(&tx_hash).await {
                Ok(false) => Ok(None),
                Ok(true) => {
                    info!(
                        digest = %record.digest,
                        tx_hash = %tx_ref(&tx_hash),
                        "Earlier transaction still pending, not resubmitting"
                    );
                    Ok(Some(AnchorOutcome::Timeout(record.clone())))
                }
                Err(e) => {
                    warn!(digest = %record.digest, error = %e, "Could not check earlier transaction");
                    Ok(Some(AnchorOutcome::Failed(record.clone())))
                }
            },
        }
    }

    async fn keep_local(&self, mut record: ProofRecord) -> Result<AnchorOutcome> {
        match record.status {
            ProofStatus::Pending => {
                record.mark_local_only()?;
                self.ledger.put(&record).await?;
                info!(digest = %record.digest, "No signing chain available, proof stored locally");
                Ok(AnchorOutcome::LocalOnly(record))
            }
            ProofStatus::LocalOnly => Ok(AnchorOutcome::LocalOnly(record)),
            _ => Ok(AnchorOutcome::Failed(record)),
        }
    }

    /// Sign, record, then broadcast.
    ///
    /// The record turns `submitted` with the signed hash before anything is
    /// sent, so a crash or a lost answer can never leave a transaction on
    /// chain that the ledger does not know. The nonce lock stays held across
    /// that write.
    async fn submit(&self, chain: &ChainClient, mut record: ProofRecord) -> Result<AnchorOutcome> {
        let owned_digest = record.digest;
        let digest = &owned_digest;
        let prepared = self
            .config
            .submission_retry
            .run("anchor preparation", move || chain.prepare_anchor(digest))
            .await;

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(digest = %digest, error = %e, "Could not prepare anchor transaction");
                record.mark_failed(e.to_string())?;
                self.ledger.put(&record).await?;
                return Ok(AnchorOutcome::Failed(record));
            }
        };

        let tx_hash = prepared.tx_hash();
        record.mark_submitted(tx_hash)?;
        self.ledger.put(&record).await?;

        if let Err(e) = prepared.broadcast(&self.config.submission_retry).await {
            error!(digest = %digest, tx_hash = %tx_ref(&tx_hash), error = %e, "Anchor submission failed");
            record.mark_failed(e.to_string())?;
            self.ledger.put(&record).await?;
            return Ok(AnchorOutcome::Failed(record));
        }

        self.await_confirmation(chain, record, tx_hash).await
    }

    async fn await_confirmation(
        &self,
        chain: &ChainClient,
        mut record: ProofRecord,
        tx_hash: TxHash,
    ) -> Result<AnchorOutcome> {
        let outcome = match chain.await_receipt(&tx_hash, self.config.receipt_timeout).await {
            Ok(receipt) if receipt.success => {
                record.mark_confirmed(&receipt)?;
                info!(
                    digest = %record.digest,
                    tx_hash = %tx_ref(&tx_hash),
                    block = receipt.block_number,
                    gas_used = receipt.gas_used,
                    "Proof anchored"
                );
                AnchorOutcome::Confirmed(record)
            }
            Ok(receipt) => {
                record.mark_failed(format!(
                    "transaction reverted in block {}",
                    receipt.block_number
                ))?;
                warn!(digest = %record.digest, tx_hash = %tx_ref(&tx_hash), "Anchor transaction reverted");
                AnchorOutcome::Failed(record)
            }
            Err(e @ ChainError::ReceiptTimeout { .. }) => {
                warn!(digest = %record.digest, tx_hash = %tx_ref(&tx_hash), "Receipt wait timed out");
                self.advisory_check(chain, &record.digest, &tx_hash).await;
                record.mark_failed(e.to_string())?;
                AnchorOutcome::Timeout(record)
            }
            Err(e) => {
                error!(digest = %record.digest, error = %e, "Receipt polling failed");
                record.mark_failed(e.to_string())?;
                AnchorOutcome::Failed(record)
            }
        };

        self.ledger.put(outcome.record()).await?;
        Ok(outcome)
    }

    /// Log whether a timed-out transaction is visible after all. Never
    /// changes state; reconciliation does that.
    async fn advisory_check(&self, chain: &ChainClient, digest: &Digest, tx_hash: &TxHash) {
        match chain.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => {
                warn!(digest = %digest, success = receipt.success, block = receipt.block_number, "Receipt appeared right after the deadline")
            }
            Ok(None) => debug!(digest = %digest, "Transaction still not included"),
            Err(e) => debug!(digest = %digest, error = %e, "Advisory receipt check failed"),
        }
        match chain.read_state(digest).await {
            Ok(state) => debug!(digest = %digest, exists = state.exists, "Advisory on-chain check"),
            Err(e) => debug!(digest = %digest, error = %e, "Advisory on-chain check failed"),
        }
    }
}
