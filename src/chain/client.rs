/// Policy layer over a [`ChainBackend`].
///
/// `ChainClient` is an explicitly constructed service object shared by
/// `Arc`. It owns the single signing identity and the nonce lock that
/// serializes read-nonce → sign → submit for that identity. Everything else
/// it does (gas, fees, receipts, reads) is side-effect free and runs
/// concurrently.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, FixedBytes, TxHash, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::SolCall;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    tx_ref, AnchorAttempt, CallRequest, ChainBackend, ChainError, ChainHealth, FeePolicy,
    IProofAnchor, JsonRpcBackend, OnChainState, Receipt, SignedTransaction,
};
use crate::digest::Digest;
use crate::retry::{RetryPolicy, Retryable};

const GWEI: u128 = 1_000_000_000;

/// Gas limit used when every gas strategy fails.
pub const DEFAULT_GAS_LIMIT: u64 = 150_000;

/// How the gas limit of an anchoring transaction is chosen.
/// Strategies are tried in order; the first success wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasStrategy {
    /// `eth_estimateGas` against the contract call.
    Estimate,
    /// A fixed limit.
    Fixed(u64),
}

/// How EIP-1559 fees are chosen. Tried in order; the first success wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStrategy {
    /// Derive from the latest block's base fee.
    LatestBaseFee,
    /// Use the configured fallback max fee.
    Fixed,
}

/// Fee settings, in wei.
#[derive(Debug, Clone, Copy)]
pub struct FeeConfig {
    /// Priority fee, also the floor of the max fee.
    pub priority_fee: u128,
    /// Max fee used when the base fee is unavailable.
    pub fallback_max_fee: u128,
    /// Safety margin applied to the observed base fee.
    pub base_fee_multiplier: u128,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            priority_fee: 2 * GWEI,
            fallback_max_fee: 25 * GWEI,
            base_fee_multiplier: 2,
        }
    }
}

impl FeeConfig {
    pub fn from_gwei(priority_fee_gwei: u64, fallback_max_fee_gwei: u64) -> Self {
        Self {
            priority_fee: priority_fee_gwei as u128 * GWEI,
            fallback_max_fee: fallback_max_fee_gwei as u128 * GWEI,
            ..Self::default()
        }
    }

    pub fn from_base_fee(&self, base_fee: u128) -> FeePolicy {
        let max_fee = base_fee
            .saturating_mul(self.base_fee_multiplier)
            .saturating_add(self.priority_fee);
        FeePolicy {
            max_fee_per_gas: max_fee.max(self.priority_fee),
            max_priority_fee_per_gas: self.priority_fee,
        }
    }

    pub fn fixed(&self) -> FeePolicy {
        FeePolicy {
            max_fee_per_gas: self.fallback_max_fee.max(self.priority_fee),
            max_priority_fee_per_gas: self.priority_fee,
        }
    }
}

/// Configuration for the ledger connection.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// JSON-RPC endpoint (e.g., Infura, Alchemy, local node).
    pub rpc_url: String,
    /// Address of the proof anchor contract.
    pub contract_address: Address,
    /// Refuse to start if the node reports a different chain.
    pub expected_chain_id: Option<u64>,
    /// Deadline for every individual RPC request.
    pub rpc_timeout: Duration,
    /// Deadline for the liveness check performed on connect.
    pub liveness_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub gas_strategies: Vec<GasStrategy>,
    pub fee_strategies: Vec<FeeStrategy>,
    pub fees: FeeConfig,
}

impl ChainConfig {
    pub fn new(rpc_url: impl Into<String>, contract_address: Address) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address,
            expected_chain_id: None,
            rpc_timeout: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(5),
            receipt_poll_interval: Duration::from_secs(2),
            gas_strategies: vec![GasStrategy::Estimate, GasStrategy::Fixed(DEFAULT_GAS_LIMIT)],
            fee_strategies: vec![FeeStrategy::LatestBaseFee, FeeStrategy::Fixed],
            fees: FeeConfig::default(),
        }
    }
}

/// Parse a hex private key into the signing identity.
///
/// The key itself never appears in the error.
pub fn load_signing_identity(secret_key: &str) -> Result<PrivateKeySigner, ChainError> {
    let trimmed = secret_key.trim();
    if trimmed.is_empty() {
        return Err(ChainError::InvalidKey("empty key".into()));
    }
    PrivateKeySigner::from_str(trimmed).map_err(|e| ChainError::InvalidKey(e.to_string()))
}

pub struct ChainClient {
    backend: Arc<dyn ChainBackend>,
    config: ChainConfig,
    chain_id: u64,
    signer: Option<PrivateKeySigner>,
    /// Next nonce to use. `None` until first submission and after any failed one,
    /// which forces a fresh read from the chain.
    next_nonce: Mutex<Option<u64>>,
}

impl ChainClient {
    /// Connect over JSON-RPC. Fails unless the endpoint answers the liveness
    /// check within `config.liveness_timeout`.
    pub async fn connect(config: ChainConfig) -> Result<Self, ChainError> {
        let backend = JsonRpcBackend::new(&config.rpc_url, config.rpc_timeout)?;
        Self::with_backend(Arc::new(backend), config).await
    }

    /// Connect over an arbitrary transport.
    pub async fn with_backend(
        backend: Arc<dyn ChainBackend>,
        config: ChainConfig,
    ) -> Result<Self, ChainError> {
        let chain_id = tokio::time::timeout(config.liveness_timeout, backend.chain_id())
            .await
            .map_err(|_| {
                ChainError::Connectivity(format!(
                    "{} did not answer within {:?}",
                    backend.endpoint(),
                    config.liveness_timeout
                ))
            })??;

        if let Some(expected) = config.expected_chain_id {
            if expected != chain_id {
                return Err(ChainError::ChainIdMismatch {
                    expected,
                    actual: chain_id,
                });
            }
        }

        info!(endpoint = backend.endpoint(), chain_id, "Connected to chain");

        Ok(Self {
            backend,
            config,
            chain_id,
            signer: None,
            next_nonce: Mutex::new(None),
        })
    }

    /// Attach the signing identity. Without one the client is read-only.
    pub fn with_signer(mut self, signer: PrivateKeySigner) -> Self {
        info!(address = %signer.address(), "Signing identity loaded");
        self.signer = Some(signer);
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract_address(&self) -> Address {
        self.config.contract_address
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// Gas limit for `call`. Never fails: estimation errors fall through to
    /// the next strategy and finally to [`DEFAULT_GAS_LIMIT`].
    pub async fn estimate_gas(&self, call: &CallRequest) -> u64 {
        for strategy in &self.config.gas_strategies {
            match strategy {
                GasStrategy::Estimate => match self.backend.estimate_gas(call).await {
                    Ok(gas) => return gas,
                    Err(e) => warn!(error = %e, "Gas estimation failed, falling back"),
                },
                GasStrategy::Fixed(limit) => return *limit,
            }
        }
        DEFAULT_GAS_LIMIT
    }

    /// Current EIP-1559 fee policy. Never fails: without a base fee the
    /// fixed fallback is used.
    pub async fn current_fee_policy(&self) -> FeePolicy {
        for strategy in &self.config.fee_strategies {
            match strategy {
                FeeStrategy::LatestBaseFee => match self.backend.latest_base_fee().await {
                    Ok(Some(base_fee)) => return self.config.fees.from_base_fee(base_fee),
                    Ok(None) => debug!("Latest block carries no base fee"),
                    Err(e) => warn!(error = %e, "Base fee unavailable, falling back"),
                },
                FeeStrategy::Fixed => return self.config.fees.fixed(),
            }
        }
        self.config.fees.fixed()
    }

    /// Build and sign an `anchorHash(digest)` transaction without sending it.
    ///
    /// Gas and fees are resolved first; the nonce lock is then taken and
    /// travels with the returned [`PreparedAnchor`] until it is broadcast or
    /// dropped, so concurrent callers always obtain distinct, increasing
    /// nonces. Callers record the transaction hash before broadcasting.
    pub async fn prepare_anchor(&self, digest: &Digest) -> Result<PreparedAnchor<'_>, ChainError> {
        let signer = self.signer.as_ref().ok_or(ChainError::NoSigningIdentity)?;
        let from = signer.address();

        let input = Bytes::from(
            IProofAnchor::anchorHashCall {
                hash: FixedBytes::from(*digest.as_bytes()),
            }
            .abi_encode(),
        );
        let call = CallRequest {
            from: Some(from),
            to: self.config.contract_address,
            data: input.clone(),
        };

        let gas_limit = self.estimate_gas(&call).await;
        let fees = self.current_fee_policy().await;

        let next_nonce = self.next_nonce.lock().await;
        let chain_nonce = self.backend.pending_nonce(from).await?;
        let nonce = next_nonce.map_or(chain_nonce, |cached| cached.max(chain_nonce));

        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            to: TxKind::Call(self.config.contract_address),
            value: U256::ZERO,
            access_list: Default::default(),
            input,
        };
        let signed = sign_transaction(signer, tx).await?;

        Ok(PreparedAnchor {
            client: self,
            digest: *digest,
            next_nonce,
            attempt: AnchorAttempt {
                chain_id: self.chain_id,
                nonce,
                gas_limit,
                fees,
                signed,
                signed_at: Utc::now(),
            },
        })
    }

    /// Send `signed` once and settle ambiguous answers.
    ///
    /// "Already known" is success. A nonce rejection is success when the
    /// node already holds this very transaction, i.e. an earlier send of the
    /// same bytes went through; otherwise the nonce belongs to another
    /// transaction and resending cannot help.
    async fn broadcast_signed(&self, signed: &SignedTransaction) -> Result<(), ChainError> {
        match self.submit(signed).await {
            Ok(_) => Ok(()),
            Err(ChainError::AlreadyKnown(message)) => {
                debug!(tx_hash = %tx_ref(&signed.hash), reason = %message, "Node already holds the transaction");
                Ok(())
            }
            Err(ChainError::NonceConflict(message)) => {
                if self.transaction_outstanding(&signed.hash).await? {
                    debug!(tx_hash = %tx_ref(&signed.hash), "Earlier send was accepted");
                    Ok(())
                } else {
                    Err(ChainError::Submission(format!(
                        "{message}; nonce taken by another transaction"
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Included or still pending on the node.
    async fn transaction_outstanding(&self, tx_hash: &TxHash) -> Result<bool, ChainError> {
        if self.backend.transaction_receipt(tx_hash).await?.is_some() {
            return Ok(true);
        }
        self.backend.transaction_known(tx_hash).await
    }

    /// Broadcast a signed transaction. Transport failures come back as
    /// [`ChainError::Connectivity`], node rejections as
    /// [`ChainError::Submission`] (or a more specific variant).
    pub async fn submit(&self, signed: &SignedTransaction) -> Result<TxHash, ChainError> {
        let reported = self.backend.send_raw_transaction(&signed.raw).await?;
        if reported != signed.hash {
            warn!(
                local = %tx_ref(&signed.hash),
                reported = %tx_ref(&reported),
                "Node reported a different transaction hash"
            );
        }
        Ok(signed.hash)
    }

    /// Poll for the receipt of `tx_hash` until `timeout` elapses.
    ///
    /// Giving up only stops the polling; the transaction stays outstanding.
    pub async fn await_receipt(
        &self,
        tx_hash: &TxHash,
        timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            match self.backend.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!(tx_hash = %tx_ref(tx_hash), error = %e, "Receipt poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ChainError::ReceiptTimeout {
                    tx_hash: tx_ref(tx_hash),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.config.receipt_poll_interval.min(deadline - now)).await;
        }
    }

    /// Single receipt lookup, `None` while not included.
    pub async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        self.backend.transaction_receipt(tx_hash).await
    }

    /// Whether the node still knows `tx_hash`, mined or pending.
    pub async fn transaction_known(&self, tx_hash: &TxHash) -> Result<bool, ChainError> {
        self.backend.transaction_known(tx_hash).await
    }

    /// Ask the contract whether `digest` is anchored. "Not found" is
    /// `exists = false`; only transport or decoding problems are errors.
    pub async fn read_state(&self, digest: &Digest) -> Result<OnChainState, ChainError> {
        let data = IProofAnchor::verifyHashCall {
            hash: FixedBytes::from(*digest.as_bytes()),
        }
        .abi_encode();

        let output = self
            .backend
            .call(&CallRequest {
                from: None,
                to: self.config.contract_address,
                data: Bytes::from(data),
            })
            .await
            .map_err(|e| ChainError::Read(e.to_string()))?;

        let ret = IProofAnchor::verifyHashCall::abi_decode_returns(&output, true)
            .map_err(|e| ChainError::Read(format!("undecodable verifyHash result: {e}")))?;

        let exists = ret._0;
        let timestamp = if exists {
            u64::try_from(ret._1)
                .ok()
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        } else {
            None
        };

        Ok(OnChainState { exists, timestamp })
    }

    pub async fn health(&self) -> ChainHealth {
        let (latest_block, error) = match self.backend.block_number().await {
            Ok(block) => (Some(block), None),
            Err(e) => (None, Some(e.to_string())),
        };

        ChainHealth {
            chain_id: self.chain_id,
            latest_block,
            signer: self.signer_address().map(|a| a.to_string()),
            contract: self.config.contract_address.to_string(),
            error,
        }
    }
}

/// A signed anchoring transaction holding the nonce lock.
///
/// Dropping it without [`broadcast`](PreparedAnchor::broadcast) releases the
/// nonce unused.
pub struct PreparedAnchor<'a> {
    client: &'a ChainClient,
    digest: Digest,
    next_nonce: MutexGuard<'a, Option<u64>>,
    attempt: AnchorAttempt,
}

impl PreparedAnchor<'_> {
    pub fn tx_hash(&self) -> TxHash {
        self.attempt.tx_hash()
    }

    pub fn attempt(&self) -> &AnchorAttempt {
        &self.attempt
    }

    /// Broadcast the signed bytes, resending the very same bytes on
    /// transport failures. Never re-signs, so one prepared anchor can put at
    /// most one transaction on chain.
    pub async fn broadcast(self, retry: &RetryPolicy) -> Result<AnchorAttempt, ChainError> {
        let PreparedAnchor {
            client,
            digest,
            mut next_nonce,
            attempt,
        } = self;

        let signed = &attempt.signed;
        let result = retry
            .run("anchor broadcast", move || client.broadcast_signed(signed))
            .await;

        if let Err(e) = result {
            *next_nonce = None;
            return Err(e);
        }
        *next_nonce = Some(attempt.nonce + 1);
        drop(next_nonce);

        info!(
            digest = %digest,
            tx_hash = %tx_ref(&attempt.tx_hash()),
            nonce = attempt.nonce,
            gas_limit = attempt.gas_limit,
            max_fee_per_gas = attempt.fees.max_fee_per_gas as u64,
            "Anchor transaction submitted"
        );
        Ok(attempt)
    }
}

async fn sign_transaction(
    signer: &PrivateKeySigner,
    tx: TxEip1559,
) -> Result<SignedTransaction, ChainError> {
    let sig_hash = tx.signature_hash();
    let sig = signer
        .sign_hash(&sig_hash)
        .await
        .map_err(|e| ChainError::Signing(e.to_string()))?;

    let signed = tx.into_signed(sig);
    let hash = *signed.hash();
    let envelope = TxEnvelope::Eip1559(signed);

    let mut raw = Vec::new();
    envelope.encode_2718(&mut raw);

    Ok(SignedTransaction {
        hash,
        raw: Bytes::from(raw),
    })
}
