//! In-memory collaborators shared by the unit tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bytes, TxHash, TxKind};
use alloy::sol_types::SolCall;
use async_trait::async_trait;

use crate::chain::{
    load_signing_identity, AnchorAttempt, CallRequest, ChainBackend, ChainClient, ChainConfig,
    ChainError, IProofAnchor, Receipt,
};
use crate::digest::Digest;
use crate::generation::{GenerationError, GenerationRequest, Generator};
use crate::ledger::LocalLedger;
use crate::retry::RetryPolicy;

/// Anvil's first development account.
pub(crate) const TEST_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub(crate) const CHAIN_ID: u64 = 31337;
/// Timestamp of block 0 of the mock chain.
const GENESIS_TIME: u64 = 1_700_000_000;

pub(crate) fn contract_address() -> Address {
    Address::repeat_byte(0x42)
}

pub(crate) fn chain_config() -> ChainConfig {
    let mut config = ChainConfig::new("mock://chain", contract_address());
    config.receipt_poll_interval = Duration::from_millis(5);
    config.liveness_timeout = Duration::from_millis(200);
    config
}

pub(crate) async fn read_only_client(mock: Arc<MockChain>) -> ChainClient {
    ChainClient::with_backend(mock, chain_config())
        .await
        .unwrap()
}

pub(crate) async fn signing_client(mock: Arc<MockChain>) -> ChainClient {
    read_only_client(mock)
        .await
        .with_signer(load_signing_identity(TEST_KEY).unwrap())
}

/// Sign and broadcast in one go, single attempt.
pub(crate) async fn anchor_now(
    client: &ChainClient,
    digest: &Digest,
) -> Result<AnchorAttempt, ChainError> {
    client
        .prepare_anchor(digest)
        .await?
        .broadcast(&RetryPolicy::none())
        .await
}

pub(crate) async fn memory_ledger() -> LocalLedger {
    let ledger = LocalLedger::in_memory().await.unwrap();
    ledger.migrate().await.unwrap();
    ledger
}

/// What the mock chain does with an accepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inclusion {
    /// Mined in the next block, execution succeeds.
    Immediate,
    /// Mined in the next block, execution reverts.
    Reverted,
    /// Kept in the mempool until [`MockChain::include_withheld`].
    Withheld,
}

/// A transaction the mock chain accepted.
#[derive(Debug, Clone)]
pub(crate) struct SentTx {
    pub hash: TxHash,
    pub nonce: u64,
    pub to: Address,
    pub digest: [u8; 32],
}

struct MockState {
    inclusion: Inclusion,
    unreachable: bool,
    reads_unreachable: bool,
    stalled: bool,
    failing_sends: u32,
    lost_responses: u32,
    base_fee: Option<u128>,
    estimate: Option<u64>,
    block: u64,
    next_nonce: u64,
    sent: Vec<SentTx>,
    withheld: Vec<SentTx>,
    receipts: HashMap<TxHash, Receipt>,
    anchored: HashMap<[u8; 32], u64>,
}

/// A single-account EVM chain running the proof anchor contract.
///
/// Enforces nonce ordering the way a node does: a transaction whose nonce is
/// not exactly the account's pending count is rejected.
pub(crate) struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                inclusion: Inclusion::Immediate,
                unreachable: false,
                reads_unreachable: false,
                stalled: false,
                failing_sends: 0,
                lost_responses: 0,
                base_fee: Some(1_000_000_000),
                estimate: Some(45_000),
                block: 0,
                next_nonce: 0,
                sent: Vec::new(),
                withheld: Vec::new(),
                receipts: HashMap::new(),
                anchored: HashMap::new(),
            }),
        })
    }

    pub fn set_inclusion(&self, inclusion: Inclusion) {
        self.state.lock().unwrap().inclusion = inclusion;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_reads_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().reads_unreachable = unreachable;
    }

    /// `eth_chainId` never answers.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().unwrap().stalled = stalled;
    }

    /// The next `n` submissions fail with a connectivity error before
    /// reaching the node.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().unwrap().failing_sends = n;
    }

    /// The next `n` submissions are accepted, but the answer is lost and the
    /// caller sees a connectivity error.
    pub fn lose_next_responses(&self, n: u32) {
        self.state.lock().unwrap().lost_responses = n;
    }

    /// Burn the account's next nonce with a transaction this client never saw.
    pub fn consume_nonce(&self) {
        let mut state = self.state.lock().unwrap();
        state.next_nonce += 1;
        state.block += 1;
    }

    pub fn set_base_fee(&self, base_fee: Option<u128>) {
        self.state.lock().unwrap().base_fee = base_fee;
    }

    pub fn set_estimate(&self, estimate: Option<u64>) {
        self.state.lock().unwrap().estimate = estimate;
    }

    /// Mine every withheld transaction successfully. Returns how many.
    pub fn include_withheld(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let withheld = std::mem::take(&mut state.withheld);
        for tx in &withheld {
            mine(&mut state, tx, true);
        }
        withheld.len()
    }

    /// Anchor `digest` from some other account.
    pub fn anchor_externally(&self, digest: [u8; 32]) {
        let mut state = self.state.lock().unwrap();
        state.block += 1;
        let timestamp = GENESIS_TIME + state.block;
        state.anchored.insert(digest, timestamp);
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn accepted_nonces(&self) -> Vec<u64> {
        self.sent().iter().map(|tx| tx.nonce).collect()
    }

    fn check_reachable(&self) -> Result<(), ChainError> {
        if self.state.lock().unwrap().unreachable {
            return Err(ChainError::Connectivity("connection refused".into()));
        }
        Ok(())
    }
}

fn mine(state: &mut MockState, tx: &SentTx, success: bool) {
    state.block += 1;
    let block_number = state.block;
    state.receipts.insert(
        tx.hash,
        Receipt {
            tx_hash: tx.hash,
            success,
            block_number,
            gas_used: 43_512,
        },
    );
    if success {
        state.anchored.insert(tx.digest, GENESIS_TIME + block_number);
    }
}

fn decode_digest_arg(input: &[u8], selector: [u8; 4]) -> Result<[u8; 32], ChainError> {
    if input.len() != 36 || input[..4] != selector {
        return Err(ChainError::Reverted("unknown function".into()));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&input[4..36]);
    Ok(digest)
}

#[async_trait]
impl ChainBackend for MockChain {
    fn endpoint(&self) -> &str {
        "mock"
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        if self.state.lock().unwrap().stalled {
            std::future::pending::<()>().await;
        }
        self.check_reachable()?;
        Ok(CHAIN_ID)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().block)
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64, ChainError> {
        tokio::task::yield_now().await;
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().next_nonce)
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().base_fee)
    }

    async fn estimate_gas(&self, _call: &CallRequest) -> Result<u64, ChainError> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .estimate
            .ok_or_else(|| ChainError::Rpc {
                code: -32000,
                message: "gas required exceeds allowance".into(),
            })
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, ChainError> {
        tokio::task::yield_now().await;
        self.check_reachable()?;

        let mut buf = raw;
        let envelope = TxEnvelope::decode_2718(&mut buf)
            .map_err(|e| ChainError::Submission(format!("undecodable transaction: {e}")))?;
        let TxEnvelope::Eip1559(signed) = envelope else {
            return Err(ChainError::Submission("expected an EIP-1559 transaction".into()));
        };
        let hash = *signed.hash();
        let tx = signed.tx();

        let mut state = self.state.lock().unwrap();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(ChainError::Connectivity("connection reset".into()));
        }
        if state.withheld.iter().any(|sent| sent.hash == hash) {
            return Err(ChainError::AlreadyKnown("already known".into()));
        }
        if tx.chain_id != CHAIN_ID {
            return Err(ChainError::Submission("invalid chain id".into()));
        }
        if tx.nonce != state.next_nonce {
            return Err(ChainError::NonceConflict(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                state.next_nonce, tx.nonce
            )));
        }
        let TxKind::Call(to) = tx.to else {
            return Err(ChainError::Submission("contract creation not supported".into()));
        };
        let digest = decode_digest_arg(&tx.input, IProofAnchor::anchorHashCall::SELECTOR)?;

        state.next_nonce += 1;
        let sent = SentTx {
            hash,
            nonce: tx.nonce,
            to,
            digest,
        };
        state.sent.push(sent.clone());
        match state.inclusion {
            Inclusion::Immediate => mine(&mut state, &sent, true),
            Inclusion::Reverted => mine(&mut state, &sent, false),
            Inclusion::Withheld => state.withheld.push(sent),
        }
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ChainError::Connectivity("operation timed out".into()));
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().receipts.get(tx_hash).cloned())
    }

    async fn transaction_known(&self, tx_hash: &TxHash) -> Result<bool, ChainError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        Ok(state.receipts.contains_key(tx_hash) || state.withheld.iter().any(|sent| sent.hash == *tx_hash))
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, ChainError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if state.reads_unreachable {
            return Err(ChainError::Connectivity("read timed out".into()));
        }
        let digest = decode_digest_arg(&call.data, IProofAnchor::verifyHashCall::SELECTOR)?;

        // (bool exists, uint256 timestamp), both left-padded words.
        let mut out = vec![0u8; 64];
        if let Some(timestamp) = state.anchored.get(&digest) {
            out[31] = 1;
            out[56..64].copy_from_slice(&timestamp.to_be_bytes());
        }
        Ok(Bytes::from(out))
    }
}

/// Canned text generator.
pub(crate) struct StubGenerator {
    failure: Option<GenerationError>,
    calls: AtomicU32,
}

impl StubGenerator {
    /// Answers every prompt with `"echo: <prompt>"`.
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(error: GenerationError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(format!("echo: {}", request.prompt)),
        }
    }
}
