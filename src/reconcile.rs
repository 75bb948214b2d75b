/// Reconciliation between the local ledger and the chain.
///
/// The ledger is immediately consistent, the chain only eventually. This
/// module answers "is this proof anchored?" from both sides and repairs
/// local records once delayed confirmations land. It never deletes.
use std::sync::Arc;

use alloy::primitives::TxHash;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::anchor::DigestOwnership;
use crate::chain::{tx_ref, ChainClient, ChainError};
use crate::digest::{digest, Digest};
use crate::error::{ProofError, Result};
use crate::ledger::{LocalLedger, ProofRecord, ProofStatus};

/// What the chain says about a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OnChain {
    Present { timestamp: Option<DateTime<Utc>> },
    Absent,
    /// The chain could not be asked. Distinct from `Absent`.
    Unreachable { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub digest: Digest,
    pub local_record_exists: bool,
    #[serde(skip)]
    pub local_record: Option<ProofRecord>,
    pub on_chain: OnChain,
    /// Both the ledger and the chain know the digest.
    pub consistent: bool,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub reverted: usize,
    pub unchanged: usize,
    pub errors: usize,
}

pub struct Reconciler {
    ledger: LocalLedger,
    chain: Option<Arc<ChainClient>>,
    ownership: Arc<DigestOwnership>,
}

impl Reconciler {
    pub fn new(
        ledger: LocalLedger,
        chain: Option<Arc<ChainClient>>,
        ownership: Arc<DigestOwnership>,
    ) -> Self {
        Self {
            ledger,
            chain,
            ownership,
        }
    }

    /// Check a (prompt, response) pair against both stores.
    ///
    /// The digest is always recomputed from the text. A chain read failure
    /// degrades to [`OnChain::Unreachable`]; a ledger failure is an error.
    pub async fn verify(&self, prompt: &str, response: &str) -> Result<Verification> {
        let digest = digest(prompt, response);
        let local_record = self.ledger.get(&digest).await?;

        let on_chain = match &self.chain {
            None => OnChain::Unreachable {
                error: "no chain configured".into(),
            },
            Some(chain) => match chain.read_state(&digest).await {
                Ok(state) if state.exists => OnChain::Present {
                    timestamp: state.timestamp,
                },
                Ok(_) => OnChain::Absent,
                Err(e) => {
                    warn!(digest = %digest, error = %e, "On-chain verification unavailable");
                    OnChain::Unreachable {
                        error: e.to_string(),
                    }
                }
            },
        };

        let local_record_exists = local_record.is_some();
        let consistent = local_record_exists && matches!(on_chain, OnChain::Present { .. });
        debug!(digest = %digest, local_record_exists, consistent, "Verified proof");

        Ok(Verification {
            digest,
            local_record_exists,
            local_record,
            on_chain,
            consistent,
        })
    }

    pub async fn lookup_by_tx(&self, tx_hash: &TxHash) -> Result<ProofRecord> {
        self.ledger
            .find_by_tx(tx_hash)
            .await?
            .ok_or_else(|| ProofError::NotFound(tx_ref(tx_hash)))
    }

    /// Re-check outstanding transactions: `submitted` records and `failed`
    /// records that still carry a transaction.
    ///
    /// A successful receipt promotes to `confirmed`; a revert moves a
    /// `submitted` record to `failed`; no receipt leaves it alone. Chain read
    /// errors are counted, not fatal.
    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport> {
        let chain = self.chain.as_ref().ok_or_else(|| {
            ProofError::Chain(ChainError::Connectivity("no chain configured".into()))
        })?;

        let candidates = self.ledger.scan_awaiting_receipt(limit).await?;

        let mut report = ReconcileReport::default();
        for candidate in candidates {
            report.scanned += 1;

            let _owner = self.ownership.acquire(candidate.digest).await;
            // Re-read under ownership; an anchor call may have moved it on.
            let Some(mut record) = self.ledger.get(&candidate.digest).await? else {
                report.unchanged += 1;
                continue;
            };
            let Some(tx_hash) = record.chain_tx else {
                report.unchanged += 1;
                continue;
            };
            if !matches!(record.status, ProofStatus::Submitted | ProofStatus::Failed) {
                report.unchanged += 1;
                continue;
            }

            match chain.transaction_receipt(&tx_hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    record.mark_confirmed(&receipt)?;
                    self.ledger.put(&record).await?;
                    info!(
                        digest = %record.digest,
                        tx_hash = %tx_ref(&tx_hash),
                        block = receipt.block_number,
                        "Reconciled delayed confirmation"
                    );
                    report.confirmed += 1;
                }
                Ok(Some(receipt)) if record.status == ProofStatus::Submitted => {
                    record.mark_failed(format!(
                        "transaction reverted in block {}",
                        receipt.block_number
                    ))?;
                    self.ledger.put(&record).await?;
                    warn!(digest = %record.digest, tx_hash = %tx_ref(&tx_hash), "Reconciled revert");
                    report.reverted += 1;
                }
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    warn!(digest = %record.digest, error = %e, "Receipt lookup failed during reconciliation");
                    report.errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            confirmed = report.confirmed,
            reverted = report.reverted,
            errors = report.errors,
            "Reconciliation pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::anchor::{AnchorConfig, AnchorOutcome, Anchorer};
    use crate::retry::RetryPolicy;
    use crate::testing::{self, Inclusion, MockChain};

    struct Harness {
        mock: Arc<MockChain>,
        chain: Arc<ChainClient>,
        ledger: LocalLedger,
        anchorer: Anchorer,
        reconciler: Reconciler,
    }

    async fn harness() -> Harness {
        let mock = MockChain::new();
        let chain = Arc::new(testing::signing_client(mock.clone()).await);
        let ledger = testing::memory_ledger().await;
        let ownership = Arc::new(DigestOwnership::new());
        let anchorer = Anchorer::new(
            ledger.clone(),
            Some(chain.clone()),
            ownership.clone(),
            AnchorConfig {
                receipt_timeout: Duration::from_millis(30),
                submission_retry: RetryPolicy::none(),
            },
        );
        let reconciler = Reconciler::new(ledger.clone(), Some(chain.clone()), ownership);
        Harness {
            mock,
            chain,
            ledger,
            anchorer,
            reconciler,
        }
    }

    async fn store(ledger: &LocalLedger, prompt: &str, response: &str) -> ProofRecord {
        let record = ProofRecord::new(prompt, response, "gpt-4o", 0.7);
        ledger.put(&record).await.unwrap();
        record
    }

    /// A `submitted` record whose transaction the chain handles per `inclusion`.
    async fn submitted(h: &Harness, prompt: &str, inclusion: Inclusion) -> ProofRecord {
        h.mock.set_inclusion(inclusion);
        let mut record = store(&h.ledger, prompt, "response").await;
        let attempt = testing::anchor_now(&h.chain, &record.digest).await.unwrap();
        record.mark_submitted(attempt.tx_hash()).unwrap();
        h.ledger.put(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_verify_before_and_after_confirmation() {
        let h = harness().await;
        let record = store(&h.ledger, "test", "hello").await;

        let before = h.reconciler.verify("test", "hello").await.unwrap();
        assert!(before.local_record_exists);
        assert_eq!(before.on_chain, OnChain::Absent);
        assert!(!before.consistent);

        h.anchorer.anchor(&record.digest).await.unwrap();

        let after = h.reconciler.verify("test", "hello").await.unwrap();
        assert_eq!(after.digest, record.digest);
        assert!(matches!(after.on_chain, OnChain::Present { timestamp: Some(_) }));
        assert!(after.consistent);
    }

    #[tokio::test]
    async fn test_verify_recomputes_digest() {
        let h = harness().await;
        let record = store(&h.ledger, "test", "hello").await;
        h.anchorer.anchor(&record.digest).await.unwrap();

        let tampered = h.reconciler.verify("test", "hello!").await.unwrap();
        assert!(!tampered.local_record_exists);
        assert_eq!(tampered.on_chain, OnChain::Absent);
        assert!(!tampered.consistent);
    }

    #[tokio::test]
    async fn test_verify_with_unreachable_chain_returns_local_proof() {
        let h = harness().await;
        store(&h.ledger, "offline", "check").await;
        h.mock.set_reads_unreachable(true);

        let v = h.reconciler.verify("offline", "check").await.unwrap();
        assert!(v.local_record_exists);
        assert!(v.local_record.is_some());
        assert!(matches!(v.on_chain, OnChain::Unreachable { .. }));
        assert!(!v.consistent);
    }

    #[tokio::test]
    async fn test_verify_chain_only_is_inconsistent() {
        let h = harness().await;
        h.mock.anchor_externally(*digest("elsewhere", "anchored").as_bytes());

        let v = h.reconciler.verify("elsewhere", "anchored").await.unwrap();
        assert!(!v.local_record_exists);
        assert!(matches!(v.on_chain, OnChain::Present { .. }));
        assert!(!v.consistent);
    }

    #[tokio::test]
    async fn test_verify_without_chain() {
        let ledger = testing::memory_ledger().await;
        store(&ledger, "no", "chain").await;
        let reconciler = Reconciler::new(ledger, None, Arc::new(DigestOwnership::new()));

        let v = reconciler.verify("no", "chain").await.unwrap();
        assert!(v.local_record_exists);
        assert!(matches!(v.on_chain, OnChain::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_verify_surfaces_ledger_failure() {
        let h = harness().await;
        h.ledger.close().await;
        assert!(matches!(
            h.reconciler.verify("a", "b").await,
            Err(ProofError::Ledger(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_tx() {
        let h = harness().await;
        let record = store(&h.ledger, "lookup", "me").await;
        let outcome = h.anchorer.anchor(&record.digest).await.unwrap();
        let tx_hash = outcome.record().chain_tx.unwrap();

        let found = h.reconciler.lookup_by_tx(&tx_hash).await.unwrap();
        assert_eq!(found.digest, record.digest);
        assert_eq!(found.status, ProofStatus::Confirmed);

        let err = h
            .reconciler
            .lookup_by_tx(&TxHash::repeat_byte(0xee))
            .await
            .unwrap_err();
        assert!(matches!(err, ProofError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reconcile_promotes_delayed_confirmation() {
        let h = harness().await;
        h.mock.set_inclusion(Inclusion::Withheld);
        let record = store(&h.ledger, "delayed", "receipt").await;
        let outcome = h.anchorer.anchor(&record.digest).await.unwrap();
        assert!(matches!(outcome, AnchorOutcome::Timeout(_)));

        // Nothing landed yet: nothing changes.
        let report = h.reconciler.reconcile(10).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.unchanged, 1);

        h.mock.include_withheld();
        let report = h.reconciler.reconcile(10).await.unwrap();
        assert_eq!(report.confirmed, 1);

        let stored = h.ledger.get(&record.digest).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Confirmed);
        assert!(h.reconciler.verify("delayed", "receipt").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_reconcile_marks_reverted_submission_failed() {
        let h = harness().await;
        let record = submitted(&h, "reverting", Inclusion::Reverted).await;

        let report = h.reconciler.reconcile(10).await.unwrap();
        assert_eq!(report.reverted, 1);
        let stored = h.ledger.get(&record.digest).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Failed);
        assert_eq!(stored.chain_tx, record.chain_tx);
    }

    #[tokio::test]
    async fn test_reconcile_skips_records_without_transaction() {
        let h = harness().await;
        let mut record = store(&h.ledger, "never", "sent").await;
        record.mark_failed("connection refused").unwrap();
        h.ledger.put(&record).await.unwrap();
        store(&h.ledger, "still", "pending").await;

        let report = h.reconciler.reconcile(10).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_is_not_starved_by_unsent_failures() {
        let h = harness().await;
        for i in 0..3 {
            let mut record = store(&h.ledger, &format!("outage {i}"), "response").await;
            record.mark_failed("connection refused").unwrap();
            h.ledger.put(&record).await.unwrap();
        }
        let record = submitted(&h, "landed later", Inclusion::Withheld).await;
        h.mock.include_withheld();

        let report = h.reconciler.reconcile(3).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.confirmed, 1);
        let stored = h.ledger.get(&record.digest).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_reconcile_counts_chain_errors() {
        let h = harness().await;
        let record = submitted(&h, "unreachable", Inclusion::Withheld).await;
        h.mock.set_unreachable(true);

        let report = h.reconciler.reconcile(10).await.unwrap();
        assert_eq!(report.errors, 1);
        let stored = h.ledger.get(&record.digest).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Submitted);
    }

    #[tokio::test]
    async fn test_reconcile_requires_chain() {
        let ledger = testing::memory_ledger().await;
        let reconciler = Reconciler::new(ledger, None, Arc::new(DigestOwnership::new()));
        assert!(matches!(
            reconciler.reconcile(10).await,
            Err(ProofError::Chain(_))
        ));
    }
}
