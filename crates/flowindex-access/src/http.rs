//! REST transport for Flow access nodes, backed by `reqwest`.
//!
//! Speaks the access REST API (`/v1/blocks`, `/v1/collections`,
//! `/v1/transactions`, `/v1/transaction_results`, `/v1/accounts`). Gateways
//! in front of early-spork nodes expose the legacy result shape under
//! `/legacy/v1/transaction_results`.
//!
//! uint64 values arrive as decimal strings and binary fields as base64.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use flowindex_core::types::{
    Account, BlockHeader, Collection, CollectionGuarantee, Event, ProposalKey, Transaction,
    TransactionResult, TransactionStatus,
};

use crate::error::{AccessError, RpcCode};
use crate::legacy::LegacyTransactionResult;
use crate::transport::AccessTransport;

/// Configuration for `HttpAccessTransport`.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub request_timeout: Duration,
    /// Path prefix of the legacy result service.
    pub legacy_prefix: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            legacy_prefix: "/legacy".into(),
        }
    }
}

/// One access node reached over HTTP.
pub struct HttpAccessTransport {
    address: String,
    base_url: String,
    legacy_prefix: String,
    http: reqwest::Client,
}

impl HttpAccessTransport {
    /// Create a transport for `address` (`host:port` or a full URL).
    pub fn new(address: impl Into<String>, config: HttpTransportConfig) -> Result<Self, AccessError> {
        let address = address.into();
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AccessError::Config(format!("http client: {e}")))?;
        Ok(Self {
            address,
            base_url,
            legacy_prefix: config.legacy_prefix,
            http,
        })
    }

    /// Create with default configuration.
    pub fn default_for(address: impl Into<String>) -> Result<Self, AccessError> {
        Self::new(address, HttpTransportConfig::default())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AccessError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::trace!(url = %url, "GET");
        let resp = self.http.get(&url).send().await.map_err(map_reqwest)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(map_reqwest)?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        serde_json::from_slice(&body).map_err(|e| AccessError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl AccessTransport for HttpAccessTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn latest_sealed_height(&self) -> Result<u64, AccessError> {
        let blocks: Vec<RestBlock> = self.get_json("/v1/blocks?height=sealed").await?;
        blocks
            .into_iter()
            .next()
            .map(|b| b.header.height)
            .ok_or_else(|| AccessError::rpc(RpcCode::NotFound, "no sealed block returned"))
    }

    async fn block_by_height(&self, height: u64) -> Result<BlockHeader, AccessError> {
        let blocks: Vec<RestBlock> = self
            .get_json(&format!("/v1/blocks?height={height}&expand=payload"))
            .await?;
        let block = blocks
            .into_iter()
            .next()
            .ok_or_else(|| AccessError::rpc(RpcCode::NotFound, format!("block at height {height} not found")))?;
        Ok(block.into_header())
    }

    async fn collection(&self, id: &str) -> Result<Collection, AccessError> {
        let c: RestCollection = self
            .get_json(&format!("/v1/collections/{id}?expand=transactions"))
            .await?;
        Ok(c.into_collection())
    }

    async fn transaction(&self, id: &str) -> Result<Transaction, AccessError> {
        let t: RestTransaction = self.get_json(&format!("/v1/transactions/{id}")).await?;
        Ok(t.into_transaction())
    }

    async fn transaction_result(&self, id: &str) -> Result<TransactionResult, AccessError> {
        let r: RestTransactionResult = self
            .get_json(&format!("/v1/transaction_results/{id}"))
            .await?;
        Ok(r.into_result())
    }

    async fn transaction_result_legacy(
        &self,
        id: &str,
    ) -> Result<LegacyTransactionResult, AccessError> {
        self.get_json(&format!("{}/v1/transaction_results/{id}", self.legacy_prefix))
            .await
    }

    async fn account(&self, address: &str) -> Result<Account, AccessError> {
        let a: RestAccount = self.get_json(&format!("/v1/accounts/{address}")).await?;
        Ok(Account {
            address: a.address,
            balance: a.balance,
            contracts: a.contracts.into_keys().collect(),
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> AccessError {
    if e.is_timeout() {
        AccessError::rpc(RpcCode::DeadlineExceeded, e.to_string())
    } else if e.is_decode() {
        AccessError::Decode(e.to_string())
    } else {
        AccessError::rpc(RpcCode::Unavailable, e.to_string())
    }
}

#[derive(Deserialize)]
struct RestError {
    #[serde(default)]
    message: String,
}

fn status_error(status: u16, body: &[u8]) -> AccessError {
    let message = serde_json::from_slice::<RestError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    let message = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    };
    let code = if message.to_ascii_lowercase().contains("unknown service") {
        RpcCode::Unimplemented
    } else {
        RpcCode::from_http_status(status)
    };
    AccessError::rpc(code, message)
}

// ─── Wire helpers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(u64),
    Str(String),
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match NumOrString::deserialize(d)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = de_u64(d)?;
    u32::try_from(v).map_err(serde::de::Error::custom)
}

fn decode_b64(s: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .unwrap_or_else(|_| s.as_bytes().to_vec())
}

fn decode_b64_text(s: &str) -> String {
    String::from_utf8_lossy(&decode_b64(s)).into_owned()
}

/// Serde adapter for base64-encoded byte fields.
pub mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ─── REST models ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RestBlock {
    header: RestHeader,
    #[serde(default)]
    payload: Option<RestPayload>,
}

#[derive(Deserialize)]
struct RestHeader {
    id: String,
    parent_id: String,
    #[serde(deserialize_with = "de_u64")]
    height: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct RestPayload {
    #[serde(default)]
    collection_guarantees: Vec<RestGuarantee>,
}

#[derive(Deserialize)]
struct RestGuarantee {
    collection_id: String,
}

impl RestBlock {
    fn into_header(self) -> BlockHeader {
        BlockHeader {
            height: self.header.height,
            id: self.header.id,
            parent_id: self.header.parent_id,
            timestamp: self.header.timestamp,
            collection_guarantees: self
                .payload
                .unwrap_or_default()
                .collection_guarantees
                .into_iter()
                .map(|g| CollectionGuarantee {
                    collection_id: g.collection_id,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct RestCollection {
    id: String,
    #[serde(default)]
    transactions: Vec<RestIdOnly>,
    #[serde(default, rename = "_expandable")]
    expandable: Option<RestExpandable>,
}

#[derive(Deserialize)]
struct RestIdOnly {
    id: String,
}

#[derive(Deserialize)]
struct RestExpandable {
    #[serde(default)]
    transactions: Vec<String>,
}

impl RestCollection {
    fn into_collection(self) -> Collection {
        let mut ids: Vec<String> = self.transactions.into_iter().map(|t| t.id).collect();
        if ids.is_empty() {
            // Unexpanded: links of the form `/v1/transactions/<id>`.
            if let Some(exp) = self.expandable {
                ids = exp
                    .transactions
                    .iter()
                    .filter_map(|link| link.rsplit('/').next())
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        Collection {
            id: self.id,
            transaction_ids: ids,
        }
    }
}

#[derive(Deserialize)]
struct RestProposalKey {
    address: String,
    #[serde(deserialize_with = "de_u32")]
    key_index: u32,
    #[serde(deserialize_with = "de_u64")]
    sequence_number: u64,
}

#[derive(Deserialize)]
struct RestTransaction {
    id: String,
    #[serde(default)]
    script: String,
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    reference_block_id: String,
    #[serde(deserialize_with = "de_u64")]
    gas_limit: u64,
    payer: String,
    proposal_key: RestProposalKey,
    #[serde(default)]
    authorizers: Vec<String>,
}

impl RestTransaction {
    fn into_transaction(self) -> Transaction {
        Transaction {
            id: self.id,
            script: decode_b64_text(&self.script),
            arguments: self.arguments.iter().map(|a| decode_b64_text(a)).collect(),
            reference_block_id: self.reference_block_id,
            gas_limit: self.gas_limit,
            proposal_key: ProposalKey {
                address: self.proposal_key.address,
                key_index: self.proposal_key.key_index,
                sequence_number: self.proposal_key.sequence_number,
            },
            payer: self.payer,
            authorizers: self.authorizers,
        }
    }
}

#[derive(Deserialize)]
struct RestEvent {
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: String,
    #[serde(deserialize_with = "de_u32")]
    transaction_index: u32,
    #[serde(deserialize_with = "de_u32")]
    event_index: u32,
    #[serde(default)]
    payload: String,
}

#[derive(Deserialize)]
struct RestTransactionResult {
    status: String,
    #[serde(default)]
    status_code: u32,
    #[serde(default)]
    error_message: String,
    #[serde(default, deserialize_with = "de_u64")]
    computation_used: u64,
    #[serde(default)]
    events: Vec<RestEvent>,
}

impl RestTransactionResult {
    fn into_result(self) -> TransactionResult {
        TransactionResult {
            status: TransactionStatus::parse(&self.status),
            status_code: self.status_code,
            error_message: self.error_message,
            computation_used: self.computation_used,
            events: self
                .events
                .into_iter()
                .map(|e| Event {
                    payload: decode_b64(&e.payload),
                    event_type: e.event_type,
                    transaction_id: e.transaction_id,
                    transaction_index: e.transaction_index,
                    event_index: e.event_index,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct RestAccount {
    address: String,
    #[serde(deserialize_with = "de_u64")]
    balance: u64,
    #[serde(default)]
    contracts: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_from_address() {
        let t = HttpAccessTransport::default_for("access.mainnet.nodes.onflow.org:8070").unwrap();
        assert_eq!(t.base_url, "http://access.mainnet.nodes.onflow.org:8070");
        let t = HttpAccessTransport::default_for("https://rest-mainnet.onflow.org/").unwrap();
        assert_eq!(t.base_url, "https://rest-mainnet.onflow.org");
        assert_eq!(t.address(), "https://rest-mainnet.onflow.org/");
    }

    #[test]
    fn status_errors_map_to_codes() {
        let e = status_error(404, br#"{"code":404,"message":"block not found"}"#);
        assert!(matches!(e, AccessError::Rpc { code: RpcCode::NotFound, ref message } if message == "block not found"));

        let e = status_error(500, br#"{"code":500,"message":"unknown service flow.access.AccessAPI"}"#);
        assert!(e.is_unknown_service());
        assert_eq!(e.code(), Some(RpcCode::Unimplemented));

        let e = status_error(503, b"");
        assert!(e.is_transient());
        assert_eq!(e.to_string(), "rpc error: code = Unavailable desc = HTTP 503");
    }

    #[test]
    fn decodes_transaction_result() {
        let raw = r#"{
            "block_id": "ab", "collection_id": "cd", "execution": "Success",
            "status": "Sealed", "status_code": 0, "error_message": "",
            "computation_used": "42",
            "events": [{"type": "A.1654653399040a61.FlowToken.TokensWithdrawn",
                        "transaction_id": "ef", "transaction_index": "1",
                        "event_index": "0", "payload": "eyJhIjoxfQ=="}]
        }"#;
        let r: RestTransactionResult = serde_json::from_str(raw).unwrap();
        let r = r.into_result();
        assert_eq!(r.status, TransactionStatus::Sealed);
        assert_eq!(r.computation_used, 42);
        assert_eq!(r.events[0].transaction_index, 1);
        assert_eq!(r.events[0].payload, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn collection_ids_from_links() {
        let raw = r#"{"id":"c1","_expandable":{"transactions":["/v1/transactions/t1","/v1/transactions/t2"]}}"#;
        let c: RestCollection = serde_json::from_str(raw).unwrap();
        assert_eq!(c.into_collection().transaction_ids, vec!["t1", "t2"]);
    }
}
