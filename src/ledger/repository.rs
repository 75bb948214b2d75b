/// Repository layer: typed queries over `proof_records`.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// so builds never need a live database.
use futures::stream::{BoxStream, StreamExt};
use sqlx::SqlitePool;

use super::models::{ProofRecord, ProofRow, ProofStatus};
use crate::error::Result;

/// Insert or update one record, keyed by digest.
///
/// Only the mutable lifecycle columns are updated on conflict; the prompt,
/// response, generation metadata and `created_at` of an existing row are
/// never touched. A confirmed row is never modified.
pub async fn upsert_record(pool: &SqlitePool, record: &ProofRecord) -> Result<()> {
    let row = ProofRow::from(record);

    sqlx::query(
        r#"
        INSERT INTO proof_records
            (digest, prompt, response, model, temperature, chain_tx, status,
             block_number, gas_used, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT(digest) DO UPDATE SET
            chain_tx = excluded.chain_tx,
            status = excluded.status,
            block_number = excluded.block_number,
            gas_used = excluded.gas_used,
            error = excluded.error,
            updated_at = excluded.updated_at
        WHERE proof_records.status <> 'confirmed'
        "#,
    )
    .bind(&row.digest)
    .bind(&row.prompt)
    .bind(&row.response)
    .bind(&row.model)
    .bind(row.temperature)
    .bind(&row.chain_tx)
    .bind(row.status)
    .bind(row.block_number)
    .bind(row.gas_used)
    .bind(&row.error)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a new record unless the digest is already known. Returns whether
/// a row was written; an existing row is left exactly as it was.
pub async fn insert_record_if_absent(pool: &SqlitePool, record: &ProofRecord) -> Result<bool> {
    let row = ProofRow::from(record);

    let result = sqlx::query(
        r#"
        INSERT INTO proof_records
            (digest, prompt, response, model, temperature, chain_tx, status,
             block_number, gas_used, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT(digest) DO NOTHING
        "#,
    )
    .bind(&row.digest)
    .bind(&row.prompt)
    .bind(&row.response)
    .bind(&row.model)
    .bind(row.temperature)
    .bind(&row.chain_tx)
    .bind(row.status)
    .bind(row.block_number)
    .bind(row.gas_used)
    .bind(&row.error)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_record(pool: &SqlitePool, digest_hex: &str) -> Result<Option<ProofRecord>> {
    sqlx::query_as::<_, ProofRow>("SELECT * FROM proof_records WHERE digest = $1")
        .bind(digest_hex)
        .fetch_optional(pool)
        .await?
        .map(ProofRecord::try_from)
        .transpose()
}

pub async fn get_record_by_tx(pool: &SqlitePool, tx_ref: &str) -> Result<Option<ProofRecord>> {
    sqlx::query_as::<_, ProofRow>(
        "SELECT * FROM proof_records WHERE chain_tx = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(tx_ref)
    .fetch_optional(pool)
    .await?
    .map(ProofRecord::try_from)
    .transpose()
}

/// Lazily stream every record, newest first.
pub fn stream_records(pool: &SqlitePool) -> BoxStream<'_, Result<ProofRecord>> {
    sqlx::query_as::<_, ProofRow>(
        "SELECT * FROM proof_records ORDER BY created_at DESC, rowid DESC",
    )
    .fetch(pool)
    .map(|row| ProofRecord::try_from(row?))
    .boxed()
}

/// Records whose transaction still needs a receipt check: every `submitted`
/// record and every `failed` record that carries a transaction. Oldest
/// first so that long-standing records are repaired before fresh ones.
pub async fn get_records_awaiting_receipt(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<ProofRecord>> {
    sqlx::query_as::<_, ProofRow>(
        r#"
        SELECT * FROM proof_records
        WHERE status = $1 OR (status = $2 AND chain_tx IS NOT NULL)
        ORDER BY created_at ASC, rowid ASC
        LIMIT $3
        "#,
    )
    .bind(ProofStatus::Submitted)
    .bind(ProofStatus::Failed)
    .bind(limit)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(ProofRecord::try_from)
    .collect()
}

pub async fn count_records(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proof_records")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
