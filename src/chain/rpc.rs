/// JSON-RPC transport for EVM nodes.
///
/// Talks raw JSON-RPC over HTTP for maximum compatibility with hosted
/// providers (Infura, Alchemy) and local nodes (anvil, geth). Every method
/// maps to a single `eth_*` call.
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CallRequest, ChainBackend, ChainError, Receipt};

/// Simplified JSON-RPC response.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    gas_used: String,
    /// `0x1` success, `0x0` reverted. Absent on pre-Byzantium chains.
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlockHeader {
    base_fee_per_gas: Option<String>,
}

/// HTTP JSON-RPC implementation of [`ChainBackend`].
pub struct JsonRpcBackend {
    rpc_url: String,
    /// `host[:port]` of `rpc_url`; credentials and path never reach the logs.
    endpoint: String,
    client: Client,
}

impl JsonRpcBackend {
    /// Build a backend whose every request is bounded by `request_timeout`.
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChainError::Connectivity(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            endpoint: redacted_endpoint(rpc_url),
            client,
        })
    }

    /// Send a JSON-RPC request. `Ok(None)` means the node answered `null`.
    async fn rpc_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Connectivity(format!("{method}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::Connectivity(format!("{method}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ChainError::InvalidResponse(format!("{method}: HTTP {status}")));
        }

        let resp: JsonRpcResponse<T> = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ChainError::Connectivity(format!("{method}: {e}"))
            } else {
                ChainError::InvalidResponse(format!("{method} response parse error: {e}"))
            }
        })?;

        if let Some(err) = resp.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(resp.result)
    }

    /// Send a JSON-RPC request whose result must not be `null`.
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        self.rpc_request(method, params)
            .await?
            .ok_or_else(|| ChainError::InvalidResponse(format!("{method}: empty result")))
    }
}

/// Hosted providers carry API keys in the path or in the userinfo part.
fn redacted_endpoint(rpc_url: &str) -> String {
    let Ok(url) = Url::parse(rpc_url) else {
        return "unknown".to_string();
    };
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => "unknown".to_string(),
    }
}

fn call_object(call: &CallRequest) -> serde_json::Value {
    let mut object = serde_json::json!({
        "to": call.to.to_string(),
        "data": format!("0x{}", hex::encode(&call.data)),
    });
    if let Some(from) = call.from {
        object["from"] = serde_json::Value::String(from.to_string());
    }
    object
}

/// Parse a hex quantity such as `0x1a`.
pub(crate) fn parse_quantity(value: &str) -> Result<u128, ChainError> {
    u128::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::InvalidResponse(format!("invalid quantity {value:?}: {e}")))
}

fn parse_u64(value: &str) -> Result<u64, ChainError> {
    u64::try_from(parse_quantity(value)?)
        .map_err(|_| ChainError::InvalidResponse(format!("quantity out of range: {value}")))
}

/// Map a node rejection of `eth_sendRawTransaction` onto the submission taxonomy.
fn classify_send_error(err: ChainError) -> ChainError {
    let ChainError::Rpc { message, .. } = &err else {
        return err;
    };
    let lower = message.to_lowercase();
    if lower.contains("already known") || lower.contains("known transaction") {
        ChainError::AlreadyKnown(message.clone())
    } else if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("replacement transaction underpriced")
    {
        ChainError::NonceConflict(message.clone())
    } else if lower.contains("execution reverted") {
        ChainError::Reverted(message.clone())
    } else {
        ChainError::Submission(message.clone())
    }
}

impl TryFrom<RpcReceipt> for Receipt {
    type Error = ChainError;

    fn try_from(r: RpcReceipt) -> Result<Self, Self::Error> {
        let tx_hash = TxHash::from_str(&r.transaction_hash)
            .map_err(|e| ChainError::InvalidResponse(format!("invalid receipt hash: {e}")))?;
        let block_number = r
            .block_number
            .as_deref()
            .map(parse_u64)
            .transpose()?
            .ok_or_else(|| ChainError::InvalidResponse("receipt without block number".into()))?;

        Ok(Receipt {
            tx_hash,
            success: r.status.as_deref().map_or(Ok(true), |s| parse_quantity(s).map(|v| v == 1))?,
            block_number,
            gas_used: parse_u64(&r.gas_used)?,
        })
    }
}

#[async_trait]
impl ChainBackend for JsonRpcBackend {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let hex: String = self.rpc_call("eth_chainId", serde_json::json!([])).await?;
        parse_u64(&hex)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let hex: String = self.rpc_call("eth_blockNumber", serde_json::json!([])).await?;
        parse_u64(&hex)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let hex: String = self
            .rpc_call(
                "eth_getTransactionCount",
                serde_json::json!([address.to_string(), "pending"]),
            )
            .await?;
        parse_u64(&hex)
    }

    async fn latest_base_fee(&self) -> Result<Option<u128>, ChainError> {
        let header: RpcBlockHeader = self
            .rpc_call("eth_getBlockByNumber", serde_json::json!(["latest", false]))
            .await?;
        header.base_fee_per_gas.as_deref().map(parse_quantity).transpose()
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, ChainError> {
        let hex: String = self
            .rpc_call("eth_estimateGas", serde_json::json!([call_object(call)]))
            .await?;
        parse_u64(&hex)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, ChainError> {
        let raw_hex = format!("0x{}", hex::encode(raw));
        let hash: String = self
            .rpc_call("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await
            .map_err(classify_send_error)?;
        TxHash::from_str(&hash)
            .map_err(|e| ChainError::InvalidResponse(format!("invalid transaction hash: {e}")))
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .rpc_request(
                "eth_getTransactionReceipt",
                serde_json::json!([super::tx_ref(tx_hash)]),
            )
            .await?;

        match receipt {
            // Some nodes return a receipt stub before the block is sealed.
            Some(r) if r.block_number.is_none() => Ok(None),
            Some(r) => Receipt::try_from(r).map(Some),
            None => Ok(None),
        }
    }

    async fn transaction_known(&self, tx_hash: &TxHash) -> Result<bool, ChainError> {
        let tx: Option<serde_json::Value> = self
            .rpc_request(
                "eth_getTransactionByHash",
                serde_json::json!([super::tx_ref(tx_hash)]),
            )
            .await?;
        Ok(tx.is_some())
    }

    async fn call(&self, call: &CallRequest) -> Result<Bytes, ChainError> {
        let hex: String = self
            .rpc_call("eth_call", serde_json::json!([call_object(call), "latest"]))
            .await?;
        let bytes = hex::decode(hex.trim_start_matches("0x"))
            .map_err(|e| ChainError::InvalidResponse(format!("eth_call returned invalid hex: {e}")))?;
        Ok(Bytes::from(bytes))
    }
}
