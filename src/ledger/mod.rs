/// Local proof ledger.
///
/// Durable store of `digest -> ProofRecord` on SQLite, indexed by digest and
/// by transaction hash. It is the source of truth for "did we attempt this";
/// the chain is the source of truth for "did it land".
pub mod models;
pub mod repository;

pub use models::{ProofRecord, ProofStatus};

use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::TxHash;
use futures::stream::BoxStream;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::chain::tx_ref;
use crate::digest::Digest;
use crate::error::{ProofError, Result};

/// Connection pool wrapper over the ledger database.
#[derive(Clone)]
pub struct LocalLedger {
    pool: SqlitePool,
}

impl LocalLedger {
    /// Open (creating if missing) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        debug!(database_url, "Opened local ledger");
        Ok(Self { pool })
    }

    /// A private in-memory database. A single connection that is never
    /// recycled, so the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Cheap liveness check.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or update `record`. Idempotent; see [`repository::upsert_record`].
    pub async fn put(&self, record: &ProofRecord) -> Result<()> {
        repository::upsert_record(&self.pool, record).await?;
        debug!(digest = %record.digest, status = %record.status, "Ledger record written");
        Ok(())
    }

    /// Record a new proof. When the digest is already known the stored record
    /// is returned untouched instead.
    pub async fn insert_new(&self, record: &ProofRecord) -> Result<ProofRecord> {
        if repository::insert_record_if_absent(&self.pool, record).await? {
            debug!(digest = %record.digest, "New proof recorded");
            return Ok(record.clone());
        }
        self.get(&record.digest).await?.ok_or_else(|| {
            ProofError::CorruptRecord(format!("{} vanished after conflict", record.digest))
        })
    }

    pub async fn get(&self, digest: &Digest) -> Result<Option<ProofRecord>> {
        repository::get_record(&self.pool, &digest.to_hex()).await
    }

    pub async fn find_by_tx(&self, tx_hash: &TxHash) -> Result<Option<ProofRecord>> {
        repository::get_record_by_tx(&self.pool, &tx_ref(tx_hash)).await
    }

    /// Every record, newest first. Lazy and finite; rows written while the
    /// stream is being consumed may or may not appear.
    pub fn scan(&self) -> BoxStream<'_, Result<ProofRecord>> {
        repository::stream_records(&self.pool)
    }

    /// Up to `limit` records with a transaction still to be settled,
    /// oldest first. Records without a transaction never use up the limit.
    pub async fn scan_awaiting_receipt(&self, limit: usize) -> Result<Vec<ProofRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        repository::get_records_awaiting_receipt(&self.pool, limit).await
    }

    pub async fn count(&self) -> Result<i64> {
        repository::count_records(&self.pool).await
    }

    /// Close the pool; every later operation fails.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
