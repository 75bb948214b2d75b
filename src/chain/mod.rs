/// EVM ledger access for proof anchoring.
///
/// The chain layer is split in two:
/// - [`ChainBackend`]: the raw transport (JSON-RPC over HTTP in production,
///   an in-memory chain in tests). It knows nothing about policy.
/// - [`ChainClient`]: connection liveness, signing identity, gas and fee
///   policy, the nonce lock, submission and receipt polling.
///
/// The ledger contract exposes exactly two entry points:
/// `anchorHash(bytes32)` (state-mutating) and
/// `verifyHash(bytes32) returns (bool, uint256)` (view).
pub mod client;
pub mod rpc;

pub use client::{
    load_signing_identity, ChainClient, ChainConfig, FeeConfig, FeeStrategy, GasStrategy,
    PreparedAnchor,
};
pub use rpc::JsonRpcBackend;

use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash};
use alloy::sol;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::retry::Retryable;

sol! {
    interface IProofAnchor {
        function anchorHash(bytes32 hash) external;
        function verifyHash(bytes32 hash) external view returns (bool, uint256);
    }
}

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// Transport-level failure: the endpoint could not be reached or did not answer in time.
    #[error("chain endpoint unreachable: {0}")]
    Connectivity(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("no signing identity configured (read-only mode)")]
    NoSigningIdentity,

    #[error("transaction signing failed: {0}")]
    Signing(String),

    /// The node rejected the transaction.
    #[error("transaction submission rejected: {0}")]
    Submission(String),

    /// The node rejected the nonce; the next attempt must re-read it.
    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// The node already holds this exact transaction.
    #[error("transaction already known: {0}")]
    AlreadyKnown(String),

    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("no receipt for {tx_hash} after {waited:?}; the transaction may still be included")]
    ReceiptTimeout { tx_hash: String, waited: Duration },

    #[error("chain read failed: {0}")]
    Read(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    #[error("connected to chain {actual}, expected chain {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
}

impl Retryable for ChainError {
    /// Only transport failures and nonce races are transient. Reverts, key
    /// problems and node rejections are surfaced immediately.
    fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Connectivity(_) | ChainError::NonceConflict(_))
    }
}

/// Outcome of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    /// `false` when execution reverted.
    pub success: bool,
    pub block_number: u64,
    pub gas_used: u64,
}

/// Result of `verifyHash` for one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnChainState {
    pub exists: bool,
    /// Block timestamp recorded by the contract, absent when `exists` is false.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A contract call, used for `eth_call` and `eth_estimateGas`.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

/// EIP-1559 fee parameters, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A signed transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: TxHash,
    pub raw: Bytes,
}

/// One signed anchoring transaction. Never persisted; the ledger only
/// keeps the transaction hash.
#[derive(Debug, Clone)]
pub struct AnchorAttempt {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fees: FeePolicy,
    pub signed: SignedTransaction,
    pub signed_at: DateTime<Utc>,
}

impl AnchorAttempt {
    pub fn tx_hash(&self) -> TxHash {
        self.signed.hash
    }
}

/// Snapshot reported by health checks.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    pub chain_id: u64,
    pub latest_block: Option<u64>,
    pub signer: Option<String>,
    pub contract: String,
    pub error: Option<String>,
}

/// Raw ledger transport.
///
/// Implementations perform exactly one remote call per method and apply no
/// retry, fallback or caching of their own.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Endpoint description for logs (never includes credentials).
    fn endpoint(&self) -> &str;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Next nonce for `address`, counting transactions still in the mempool.
    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError>;

    /// Base fee of the latest block, `None` on pre-London chains.
    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, ChainError>;

    /// `None` while the transaction is not yet included.
    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError>;

    /// Whether the node knows `tx_hash` at all, mined or still in its mempool.
    async fn transaction_known(&self, tx_hash: &TxHash) -> Result<bool, ChainError>;

    async fn call(&self, call: &CallRequest) -> Result<Bytes, ChainError>;
}

/// Canonical text form of a transaction hash: `0x` + 64 lowercase hex characters.
pub fn tx_ref(tx_hash: &TxHash) -> String {
    format!("0x{}", hex::encode(tx_hash))
}

/// Parse a transaction reference as stored in the ledger or supplied by a caller.
pub fn parse_tx_ref(value: &str) -> Result<TxHash, ChainError> {
    let trimmed = value.trim();
    let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(body, &mut bytes)
        .map_err(|_| ChainError::InvalidResponse(format!("not a transaction hash: {value}")))?;
    Ok(TxHash::from(bytes))
}
