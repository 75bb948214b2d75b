/// The proof workflow: generate → digest → persist → anchor.
///
/// `ProofService` wires the engine components together and shapes their
/// results into the API-level responses shared by the HTTP server and the
/// CLI. It owns no state of its own beyond the collaborators.
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::anchor::{AnchorConfig, AnchorOutcome, Anchorer, DigestOwnership};
use crate::chain::{load_signing_identity, parse_tx_ref, tx_ref, ChainClient, ChainError, ChainHealth};
use crate::config::Config;
use crate::digest::Digest;
use crate::error::{ProofError, Result};
use crate::generation::{GenerationRequest, Generator, Model, OpenAiGenerator, DEFAULT_MAX_TOKENS};
use crate::ledger::{LocalLedger, ProofRecord};
use crate::reconcile::{OnChain, ReconcileReport, Reconciler, Verification};

const MIN_PROMPT_CHARS: usize = 3;
const MAX_PROMPT_CHARS: usize = 2000;

/// Body of `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProofRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Model,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_temperature() -> f64 {
    0.7
}

impl ProofRequest {
    pub fn validate(&self) -> Result<()> {
        let chars = self.prompt.chars().count();
        if !(MIN_PROMPT_CHARS..=MAX_PROMPT_CHARS).contains(&chars) {
            return Err(ProofError::Validation(format!(
                "prompt must be {MIN_PROMPT_CHARS}-{MAX_PROMPT_CHARS} characters, got {chars}"
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(ProofError::Validation("prompt must not be blank".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ProofError::Validation(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Anchoring part of a proof response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlockchainStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlockchainStatus {
    fn bare(status: &str, error: Option<String>) -> Self {
        Self {
            status: status.to_string(),
            tx_hash: None,
            block_number: None,
            gas_used: None,
            explorer_url: None,
            error,
        }
    }
}

/// Response of `POST /prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct ProofResponse {
    pub prompt: String,
    pub response: String,
    pub local_hash: Digest,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub blockchain: BlockchainStatus,
}

/// Response of `POST /verify`.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    pub hash: Digest,
    pub local_record: bool,
    pub blockchain: OnChainView,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnChainView {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Verification> for VerifyResponse {
    fn from(v: Verification) -> Self {
        let blockchain = match v.on_chain {
            OnChain::Present { timestamp } => OnChainView {
                exists: true,
                timestamp: timestamp.map(rfc3339),
                reachable: true,
                error: None,
            },
            OnChain::Absent => OnChainView {
                exists: false,
                timestamp: None,
                reachable: true,
                error: None,
            },
            OnChain::Unreachable { error } => OnChainView {
                exists: false,
                timestamp: None,
                reachable: false,
                error: Some(error),
            },
        };
        Self {
            verified: v.consistent,
            hash: v.digest,
            local_record: v.local_record_exists,
            blockchain,
        }
    }
}

/// A stored proof as returned by lookups.
#[derive(Debug, Clone, Serialize)]
pub struct ProofView {
    #[serde(flatten)]
    pub record: ProofRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub database: String,
    /// `None` when no chain is configured.
    pub blockchain: Option<ChainHealth>,
    pub generation: bool,
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct ProofService {
    ledger: LocalLedger,
    chain: Option<Arc<ChainClient>>,
    generator: Option<Arc<dyn Generator>>,
    anchorer: Anchorer,
    reconciler: Reconciler,
    explorer_tx_url: String,
}

impl ProofService {
    pub fn new(
        ledger: LocalLedger,
        chain: Option<Arc<ChainClient>>,
        generator: Option<Arc<dyn Generator>>,
        anchor_config: AnchorConfig,
        explorer_tx_url: impl Into<String>,
    ) -> Self {
        let ownership = Arc::new(DigestOwnership::new());
        Self {
            anchorer: Anchorer::new(ledger.clone(), chain.clone(), ownership.clone(), anchor_config),
            reconciler: Reconciler::new(ledger.clone(), chain.clone(), ownership),
            ledger,
            chain,
            generator,
            explorer_tx_url: explorer_tx_url.into(),
        }
    }

    /// Build every collaborator from configuration.
    ///
    /// A malformed key or a chain id mismatch is fatal. An unreachable chain
    /// is not: the service starts and stores proofs locally.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let ledger = LocalLedger::connect(&config.database_url).await?;
        ledger.migrate().await?;

        let signer = config
            .private_key
            .as_deref()
            .map(load_signing_identity)
            .transpose()?;

        let chain = match config.chain_config()? {
            None => {
                warn!("No chain configured, proofs will be stored locally only");
                None
            }
            Some(chain_config) => match ChainClient::connect(chain_config).await {
                Ok(client) => Some(Arc::new(match signer {
                    Some(signer) => client.with_signer(signer),
                    None => {
                        warn!("No signing key configured, chain access is read-only");
                        client
                    }
                })),
                Err(e @ ChainError::ChainIdMismatch { .. }) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Chain unavailable, proofs will be stored locally only");
                    None
                }
            },
        };

        let generator = match config.openai_config() {
            Some(openai) => Some(Arc::new(OpenAiGenerator::new(openai)?) as Arc<dyn Generator>),
            None => {
                warn!("No generation API key configured, /prompt is disabled");
                None
            }
        };

        Ok(Self::new(
            ledger,
            chain,
            generator,
            config.anchor_config(),
            config.explorer_tx_url.clone(),
        ))
    }

    pub fn ledger(&self) -> &LocalLedger {
        &self.ledger
    }

    pub fn explorer_url(&self, tx_hash: &alloy::primitives::TxHash) -> String {
        format!("{}{}", self.explorer_tx_url, tx_ref(tx_hash))
    }

    /// Generate a response for `request` and anchor the resulting proof.
    ///
    /// Validation and generation failures are errors and write nothing.
    /// Anything after that is reported in `blockchain.status`.
    pub async fn prove(&self, request: ProofRequest) -> Result<ProofResponse> {
        request.validate()?;

        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| ProofError::Config("no generation API key configured".into()))?;

        let response = generator
            .generate(&GenerationRequest {
                prompt: request.prompt.clone(),
                model: request.model,
                temperature: request.temperature,
                max_tokens: DEFAULT_MAX_TOKENS,
            })
            .await?;

        Ok(self
            .record_and_anchor(request.prompt, response, request.model, request.temperature)
            .await)
    }

    /// Persist a (prompt, response) proof and anchor it. Never fails: the
    /// outcome, including local write failures, is in `blockchain.status`.
    pub async fn record_and_anchor(
        &self,
        prompt: String,
        response: String,
        model: Model,
        temperature: f64,
    ) -> ProofResponse {
        let record = ProofRecord::new(prompt, response, model.as_str(), temperature);
        let digest = record.digest;

        let stored = match self.ledger.insert_new(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(digest = %digest, error = %e, "Local write failed, anchoring skipped");
                return ProofResponse {
                    timestamp: rfc3339(record.created_at),
                    prompt: record.prompt,
                    response: record.response,
                    local_hash: digest,
                    blockchain: BlockchainStatus::bare("local_write_failed", Some(e.to_string())),
                };
            }
        };

        let blockchain = match self.anchorer.anchor(&digest).await {
            Ok(outcome) => self.blockchain_status(&outcome),
            Err(e) => {
                error!(digest = %digest, error = %e, "Anchoring aborted");
                BlockchainStatus::bare("failed", Some(e.to_string()))
            }
        };

        info!(digest = %digest, status = %blockchain.status, "Proof recorded");
        ProofResponse {
            timestamp: rfc3339(stored.created_at),
            prompt: record.prompt,
            response: record.response,
            local_hash: digest,
            blockchain,
        }
    }

    fn blockchain_status(&self, outcome: &AnchorOutcome) -> BlockchainStatus {
        let record = outcome.record();
        BlockchainStatus {
            status: outcome.label().to_string(),
            tx_hash: record.chain_tx.as_ref().map(tx_ref),
            block_number: record.block_number,
            gas_used: record.gas_used,
            explorer_url: record.chain_tx.as_ref().map(|h| self.explorer_url(h)),
            error: record.error.clone(),
        }
    }

    /// Re-anchor an already stored digest, e.g. after an outage left it
    /// `failed` or `local_only`.
    pub async fn anchor(&self, digest: &Digest) -> Result<BlockchainStatus> {
        let outcome = self.anchorer.anchor(digest).await?;
        Ok(self.blockchain_status(&outcome))
    }

    pub async fn verify(&self, prompt: &str, response: &str) -> Result<Verification> {
        self.reconciler.verify(prompt, response).await
    }

    /// Look a proof up by its transaction hash (`0x`-prefixed or bare hex).
    pub async fn lookup(&self, tx_hash: &str) -> Result<ProofView> {
        let tx = parse_tx_ref(tx_hash).map_err(|e| ProofError::Validation(e.to_string()))?;
        let record = self.reconciler.lookup_by_tx(&tx).await?;
        Ok(self.view(record))
    }

    /// The `limit` most recent proofs, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ProofView>> {
        let records: Vec<ProofRecord> = self.ledger.scan().take(limit).try_collect().await?;
        Ok(records.into_iter().map(|r| self.view(r)).collect())
    }

    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport> {
        self.reconciler.reconcile(limit).await
    }

    fn view(&self, record: ProofRecord) -> ProofView {
        ProofView {
            explorer_url: record.chain_tx.as_ref().map(|h| self.explorer_url(h)),
            record,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let database = match self.ledger.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        let blockchain = match &self.chain {
            Some(chain) => Some(chain.health().await),
            None => None,
        };
        let degraded = database != "ok"
            || blockchain.as_ref().is_some_and(|c| c.error.is_some());

        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            version: env!("CARGO_PKG_VERSION"),
            database,
            blockchain,
            generation: self.generator.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::digest::digest;
    use crate::generation::GenerationError;
    use crate::retry::RetryPolicy;
    use crate::testing::{self, MockChain, StubGenerator};

    fn anchor_config() -> AnchorConfig {
        AnchorConfig {
            receipt_timeout: Duration::from_millis(50),
            submission_retry: RetryPolicy::none(),
        }
    }

    async fn service_with(
        mock: Option<Arc<MockChain>>,
        generator: Arc<StubGenerator>,
    ) -> ProofService {
        let chain = match mock {
            Some(mock) => Some(Arc::new(testing::signing_client(mock).await)),
            None => None,
        };
        ProofService::new(
            testing::memory_ledger().await,
            chain,
            Some(generator),
            anchor_config(),
            "https://sepolia.etherscan.io/tx/",
        )
    }

    fn request(prompt: &str) -> ProofRequest {
        ProofRequest {
            prompt: prompt.to_string(),
            model: Model::Gpt4o,
            temperature: 0.7,
        }
    }

    #[test]
    fn test_validation() {
        assert!(request("abc").validate().is_ok());
        assert!(request("ab").validate().is_err());
        assert!(request("     ").validate().is_err());
        assert!(request(&"x".repeat(2000)).validate().is_ok());
        assert!(request(&"x".repeat(2001)).validate().is_err());
        // Characters, not bytes.
        assert!(request("héé").validate().is_ok());

        let mut hot = request("valid prompt");
        hot.temperature = 2.5;
        assert!(hot.validate().is_err());
        hot.temperature = f64::NAN;
        assert!(hot.validate().is_err());
    }

    #[test]
    fn test_request_defaults() {
        let req: ProofRequest = serde_json::from_str(r#"{"prompt": "hello"}"#).unwrap();
        assert_eq!(req.model, Model::Gpt4o);
        assert_eq!(req.temperature, 0.7);
        assert!(serde_json::from_str::<ProofRequest>(r#"{"prompt": "hello", "model": "gpt-5"}"#).is_err());
    }

    #[tokio::test]
    async fn test_prove_anchors_generated_response() {
        let mock = MockChain::new();
        let service = service_with(Some(mock.clone()), StubGenerator::echo()).await;

        let proof = service.prove(request("what is a nonce")).await.unwrap();
        assert_eq!(proof.response, "echo: what is a nonce");
        assert_eq!(proof.local_hash, digest("what is a nonce", "echo: what is a nonce"));
        assert_eq!(proof.blockchain.status, "confirmed");

        let tx = proof.blockchain.tx_hash.clone().unwrap();
        assert_eq!(tx, tx_ref(&mock.sent()[0].hash));
        assert_eq!(
            proof.blockchain.explorer_url.as_deref(),
            Some(format!("https://sepolia.etherscan.io/tx/{tx}").as_str())
        );
        assert!(proof.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_repeat_proof_is_already_confirmed() {
        let mock = MockChain::new();
        let service = service_with(Some(mock.clone()), StubGenerator::echo()).await;

        let first = service.prove(request("same prompt")).await.unwrap();
        let second = service.prove(request("same prompt")).await.unwrap();
        assert_eq!(second.blockchain.status, "already_confirmed");
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_has_no_side_effect() {
        let generator = StubGenerator::echo();
        let service = service_with(None, generator.clone()).await;

        let err = service.prove(request("hi")).await.unwrap_err();
        assert!(matches!(err, ProofError::Validation(_)));
        assert_eq!(generator.calls(), 0);
        assert_eq!(service.ledger().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_writes_nothing() {
        let service = service_with(
            Some(MockChain::new()),
            StubGenerator::failing(GenerationError::RateLimited("quota".into())),
        )
        .await;

        let err = service.prove(request("valid prompt")).await.unwrap_err();
        assert!(matches!(err, ProofError::Generation(_)));
        assert!(err.to_string().starts_with("AI service error"));
        assert_eq!(service.ledger().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_write_failure_skips_anchoring() {
        let mock = MockChain::new();
        let service = service_with(Some(mock.clone()), StubGenerator::echo()).await;
        service.ledger().close().await;

        let proof = service.prove(request("disk full")).await.unwrap();
        assert_eq!(proof.blockchain.status, "local_write_failed");
        assert!(proof.blockchain.error.is_some());
        assert_eq!(proof.local_hash, digest("disk full", "echo: disk full"));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_chain_still_returns_local_proof() {
        let mock = MockChain::new();
        let service = service_with(Some(mock.clone()), StubGenerator::echo()).await;
        mock.set_unreachable(true);

        let proof = service.prove(request("chain is down")).await.unwrap();
        assert_eq!(proof.blockchain.status, "failed");
        assert!(proof.blockchain.error.is_some());

        let verification = service
            .verify("chain is down", "echo: chain is down")
            .await
            .unwrap();
        assert!(verification.local_record_exists);
        assert!(matches!(verification.on_chain, OnChain::Unreachable { .. }));
        assert!(!VerifyResponse::from(verification).verified);
    }

    #[tokio::test]
    async fn test_anchor_retries_stored_proof_after_outage() {
        let mock = MockChain::new();
        let service = service_with(Some(mock.clone()), StubGenerator::echo()).await;
        mock.set_unreachable(true);
        let proof = service.prove(request("outage then retry")).await.unwrap();
        assert_eq!(proof.blockchain.status, "failed");

        mock.set_unreachable(false);
        let status = service.anchor(&proof.local_hash).await.unwrap();
        assert_eq!(status.status, "confirmed");
        assert_eq!(status.tx_hash, Some(tx_ref(&mock.sent()[0].hash)));

        assert!(matches!(
            service.anchor(&digest("never", "stored")).await,
            Err(ProofError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_without_chain_proof_is_local_only() {
        let service = service_with(None, StubGenerator::echo()).await;
        let proof = service.prove(request("offline")).await.unwrap();
        assert_eq!(proof.blockchain.status, "local_only");
        assert!(proof.blockchain.tx_hash.is_none());
    }

    #[tokio::test]
    async fn test_lookup() {
        let service = service_with(Some(MockChain::new()), StubGenerator::echo()).await;
        let proof = service.prove(request("find me")).await.unwrap();
        let tx = proof.blockchain.tx_hash.unwrap();

        let view = service.lookup(&tx).await.unwrap();
        assert_eq!(view.record.prompt, "find me");
        assert!(view.explorer_url.unwrap().ends_with(&tx));

        assert!(matches!(
            service.lookup(&format!("0x{}", "00".repeat(32))).await,
            Err(ProofError::NotFound(_))
        ));
        assert!(matches!(
            service.lookup("garbage").await,
            Err(ProofError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let service = service_with(None, StubGenerator::echo()).await;
        for prompt in ["one!", "two!", "three!"] {
            service.prove(request(prompt)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let recent = service.recent(2).await.unwrap();
        let prompts: Vec<_> = recent.iter().map(|v| v.record.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["three!", "two!"]);
    }

    #[test]
    fn test_verify_response_shape() {
        let response = VerifyResponse::from(Verification {
            digest: digest("test", "hello"),
            local_record_exists: true,
            local_record: None,
            on_chain: OnChain::Present {
                timestamp: DateTime::from_timestamp(1_700_000_000, 0),
            },
            consistent: true,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["verified"], true);
        assert_eq!(
            json["hash"],
            "491738c463d855d98ecb21a025e06b093fa08d13b382d17b93db9cd0c40318fd"
        );
        assert_eq!(json["blockchain"]["exists"], true);
        assert_eq!(json["blockchain"]["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(json["blockchain"]["reachable"], true);
    }

    #[tokio::test]
    async fn test_health() {
        let service = service_with(Some(MockChain::new()), StubGenerator::echo()).await;
        let health = service.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.database, "ok");
        assert!(health.generation);
        let chain = health.blockchain.unwrap();
        assert_eq!(chain.chain_id, testing::CHAIN_ID);
        assert!(chain.signer.is_some());
    }
}
