/// Ledger models.
///
/// `ProofRecord` is the domain type; `ProofRow` mirrors the `proof_records`
/// table column for column and is converted at the repository boundary.
use std::fmt;

use alloy::primitives::TxHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::chain::{parse_tx_ref, tx_ref, Receipt};
use crate::digest::{digest, Digest};
use crate::error::{ProofError, Result};

/// Anchoring status of a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    /// Stored without a chain; may be anchored later.
    LocalOnly,
}

impl ProofStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofStatus::Pending => "pending",
            ProofStatus::Submitted => "submitted",
            ProofStatus::Confirmed => "confirmed",
            ProofStatus::Failed => "failed",
            ProofStatus::LocalOnly => "local_only",
        }
    }

    /// The complete transition table. `Confirmed` is terminal.
    pub fn can_transition_to(self, next: ProofStatus) -> bool {
        use ProofStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Pending, LocalOnly)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Failed, Pending)
                | (Failed, Confirmed)
                | (LocalOnly, Pending)
        )
    }
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proof as stored in the local ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProofRecord {
    pub digest: Digest,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub temperature: f64,
    #[serde(serialize_with = "serialize_tx")]
    pub chain_tx: Option<TxHash>,
    pub status: ProofStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    /// Last failure, kept while `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn serialize_tx<S: serde::Serializer>(
    tx: &Option<TxHash>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match tx {
        Some(hash) => serializer.serialize_some(&tx_ref(hash)),
        None => serializer.serialize_none(),
    }
}

impl ProofRecord {
    /// A fresh `pending` record. The digest is always derived from the
    /// record's own prompt and response.
    pub fn new(
        prompt: impl Into<String>,
        response: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
    ) -> Self {
        let prompt = prompt.into();
        let response = response.into();
        let now = Utc::now();
        Self {
            digest: digest(&prompt, &response),
            prompt,
            response,
            model: model.into(),
            temperature,
            chain_tx: None,
            status: ProofStatus::Pending,
            block_number: None,
            gas_used: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: ProofStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProofError::InvalidTransition {
                digest: self.digest,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> submitted` with the transaction that carries the digest.
    pub fn mark_submitted(&mut self, tx_hash: TxHash) -> Result<()> {
        self.transition(ProofStatus::Submitted)?;
        self.chain_tx = Some(tx_hash);
        self.error = None;
        Ok(())
    }

    /// `submitted | failed -> confirmed` from a successful receipt.
    pub fn mark_confirmed(&mut self, receipt: &Receipt) -> Result<()> {
        self.transition(ProofStatus::Confirmed)?;
        self.chain_tx = Some(receipt.tx_hash);
        self.block_number = Some(receipt.block_number);
        self.gas_used = Some(receipt.gas_used);
        self.error = None;
        Ok(())
    }

    /// `pending | submitted -> failed`. Any recorded transaction is kept.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(ProofStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn mark_local_only(&mut self) -> Result<()> {
        self.transition(ProofStatus::LocalOnly)
    }

    /// `failed | local_only -> pending` ahead of a fresh attempt.
    pub fn reset_pending(&mut self) -> Result<()> {
        self.transition(ProofStatus::Pending)?;
        self.chain_tx = None;
        self.error = None;
        Ok(())
    }
}

/// Row shape of `proof_records`.
#[derive(Debug, Clone, FromRow)]
pub struct ProofRow {
    pub digest: String,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub temperature: f64,
    pub chain_tx: Option<String>,
    pub status: ProofStatus,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn to_unsigned(column: &str, value: Option<i64>) -> Result<Option<u64>> {
    value
        .map(|v| u64::try_from(v).map_err(|_| ProofError::CorruptRecord(format!("negative {column}: {v}"))))
        .transpose()
}

fn to_signed(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

impl TryFrom<ProofRow> for ProofRecord {
    type Error = ProofError;

    fn try_from(row: ProofRow) -> Result<Self> {
        let digest: Digest = row
            .digest
            .parse()
            .map_err(|e| ProofError::CorruptRecord(format!("{e}")))?;
        let chain_tx = row
            .chain_tx
            .as_deref()
            .map(parse_tx_ref)
            .transpose()
            .map_err(|e| ProofError::CorruptRecord(format!("{}: {e}", row.digest)))?;

        Ok(Self {
            digest,
            block_number: to_unsigned("block_number", row.block_number)?,
            gas_used: to_unsigned("gas_used", row.gas_used)?,
            prompt: row.prompt,
            response: row.response,
            model: row.model,
            temperature: row.temperature,
            chain_tx,
            status: row.status,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&ProofRecord> for ProofRow {
    fn from(record: &ProofRecord) -> Self {
        Self {
            digest: record.digest.to_hex(),
            prompt: record.prompt.clone(),
            response: record.response.clone(),
            model: record.model.clone(),
            temperature: record.temperature,
            chain_tx: record.chain_tx.as_ref().map(tx_ref),
            status: record.status,
            block_number: to_signed(record.block_number),
            gas_used: to_signed(record.gas_used),
            error: record.error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
