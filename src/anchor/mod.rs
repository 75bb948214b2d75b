/// Proof anchoring.
///
/// Drives one digest through its lifecycle on the chain:
///
/// ```text
/// pending ──> submitted ──> confirmed
///    │            │             ▲
///    │            └──> failed ──┘  (delayed receipt observed)
///    └──> local_only      │
///            └──> pending <┘      (fresh attempt)
/// ```
///
/// Every state change is written to the local ledger before the next remote
/// call is made, so the ledger always knows which transaction, if any, is
/// outstanding for a digest.
pub mod machine;
pub mod ownership;

pub use machine::{AnchorConfig, Anchorer};
pub use ownership::{DigestOwnership, OwnershipGuard};

use crate::ledger::ProofRecord;

/// Result of one `anchor` call. Every variant carries the record as stored.
#[derive(Debug, Clone)]
pub enum AnchorOutcome {
    /// A receipt confirmed the anchoring transaction during this call.
    Confirmed(ProofRecord),
    /// The digest was already confirmed; nothing was submitted.
    AlreadyConfirmed(ProofRecord),
    /// A transaction is outstanding but no chain is available to wait on it.
    Submitted(ProofRecord),
    /// Submission failed or the transaction reverted.
    Failed(ProofRecord),
    /// No receipt within the deadline. The transaction may still land.
    Timeout(ProofRecord),
    /// No chain or no signing identity; stored locally only.
    LocalOnly(ProofRecord),
}

impl AnchorOutcome {
    pub fn record(&self) -> &ProofRecord {
        match self {
            AnchorOutcome::Confirmed(r)
            | AnchorOutcome::AlreadyConfirmed(r)
            | AnchorOutcome::Submitted(r)
            | AnchorOutcome::Failed(r)
            | AnchorOutcome::Timeout(r)
            | AnchorOutcome::LocalOnly(r) => r,
        }
    }

    pub fn into_record(self) -> ProofRecord {
        match self {
            AnchorOutcome::Confirmed(r)
            | AnchorOutcome::AlreadyConfirmed(r)
            | AnchorOutcome::Submitted(r)
            | AnchorOutcome::Failed(r)
            | AnchorOutcome::Timeout(r)
            | AnchorOutcome::LocalOnly(r) => r,
        }
    }

    /// Wire name used in API responses.
    pub fn label(&self) -> &'static str {
        match self {
            AnchorOutcome::Confirmed(_) => "confirmed",
            AnchorOutcome::AlreadyConfirmed(_) => "already_confirmed",
            AnchorOutcome::Submitted(_) => "submitted",
            AnchorOutcome::Failed(_) => "failed",
            AnchorOutcome::Timeout(_) => "timeout",
            AnchorOutcome::LocalOnly(_) => "local_only",
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            AnchorOutcome::Confirmed(_) | AnchorOutcome::AlreadyConfirmed(_)
        )
    }
}
