//! JSON-RPC ledger client
//!
//! Speaks JSON-RPC 2.0 over HTTP to a ledger node. Method names follow the
//! registry contract surface (`ownerOf`, `roleOf`, `addHash`, ...).
//! Transactions pass the submitting principal as the first positional param
//! (`from`), reads pass only their arguments.
//!
//! Error mapping:
//! - transport failure, timeout, HTTP 5xx → `Unavailable`
//! - JSON-RPC error `-32601` (method not found) → `Unsupported`
//! - any other JSON-RPC error → `Rejected`
//!
//! The node encodes "unknown product" the way a contract would: a zero
//! address owner and a zero addition time. Both are mapped to `None`.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::stream::{self, EventStreamConfig};
use super::{Ledger, LedgerError, LedgerEvent, LedgerResult, RoleAssigned};
use crate::fingerprint::Fingerprint;
use crate::model::{Address, Role};

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

/// Notification buffer per subscriber
const ROLE_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    /// HTTP JSON-RPC endpoint
    pub url: String,
    /// Timeout for individual requests
    pub request_timeout: Duration,
}

impl Default for RpcLedgerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// Ledger reached over JSON-RPC.
pub struct RpcLedger {
    config: RpcLedgerConfig,
    client: Client,
    next_id: AtomicU64,
    roles_tx: broadcast::Sender<RoleAssigned>,
}

impl RpcLedger {
    pub fn new(config: RpcLedgerConfig) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        let (roles_tx, _) = broadcast::channel(ROLE_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            client,
            next_id: AtomicU64::new(1),
            roles_tx,
        })
    }

    /// Start forwarding `RoleAssigned` notifications from the node's
    /// WebSocket endpoint to subscribers of this client.
    pub fn spawn_event_stream(
        &self,
        config: EventStreamConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        stream::spawn(config, self.roles_tx.clone(), shutdown)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> LedgerResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(id, method, "Ledger RPC request");

        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Unavailable(format!("{}: HTTP {}", method, status)));
        }

        let decoded: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("{}: bad response: {}", method, e)))?;

        if let Some(error) = decoded.error {
            debug!(method, code = error.code, message = %error.message, "Ledger RPC error");
            return Err(if error.code == METHOD_NOT_FOUND {
                LedgerError::Unsupported(method.to_string())
            } else {
                LedgerError::Rejected(error.message)
            });
        }

        let result = decoded.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| LedgerError::Rejected(format!("{}: unexpected result: {}", method, e)))
    }
}

fn is_zero_address(address: &str) -> bool {
    let hex = address.strip_prefix("0x").unwrap_or(address);
    !hex.is_empty() && hex.chars().all(|c| c == '0')
}

fn decode_owner(raw: Option<String>) -> LedgerResult<Option<Address>> {
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() || is_zero_address(&s) => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| LedgerError::Rejected(format!("ownerOfProduct: {}", e))),
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn owner_of(&self) -> LedgerResult<Address> {
        self.call("ownerOf", json!([])).await
    }

    async fn role_of(&self, address: &Address) -> LedgerResult<Role> {
        self.call("roleOf", json!([address])).await
    }

    async fn assign_role(
        &self,
        caller: &Address,
        address: &Address,
        role: Role,
    ) -> LedgerResult<()> {
        self.call::<Value>("assignRole", json!([caller, address, role]))
            .await
            .map(|_| ())
    }

    async fn add_hash(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()> {
        self.call::<Value>("addHash", json!([caller, hash]))
            .await
            .map(|_| ())
    }

    async fn bulk_add_hashes(
        &self,
        caller: &Address,
        hashes: &[Fingerprint],
    ) -> LedgerResult<Vec<Fingerprint>> {
        self.call("bulkAddHashes", json!([caller, hashes])).await
    }

    async fn verify(&self, hash: &Fingerprint) -> LedgerResult<bool> {
        self.call("verify", json!([hash])).await
    }

    async fn owner_of_product(&self, hash: &Fingerprint) -> LedgerResult<Option<Address>> {
        let raw: Option<String> = self.call("ownerOfProduct", json!([hash])).await?;
        decode_owner(raw)
    }

    async fn addition_time_of(&self, hash: &Fingerprint) -> LedgerResult<Option<u64>> {
        let raw: Option<u64> = self.call("additionTimeOf", json!([hash])).await?;
        Ok(raw.filter(|t| *t != 0))
    }

    async fn history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<u64>> {
        self.call("historyOf", json!([hash])).await
    }

    async fn typed_history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<LedgerEvent>> {
        self.call("typedHistoryOf", json!([hash])).await
    }

    async fn transfer_ownership(
        &self,
        caller: &Address,
        hash: &Fingerprint,
        new_owner: &Address,
    ) -> LedgerResult<()> {
        self.call::<Value>("transferOwnership", json!([caller, hash, new_owner]))
            .await
            .map(|_| ())
    }

    async fn set_validity(
        &self,
        caller: &Address,
        hash: &Fingerprint,
        valid: bool,
    ) -> LedgerResult<()> {
        self.call::<Value>("setValidity", json!([caller, hash, valid]))
            .await
            .map(|_| ())
    }

    async fn remove_product(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()> {
        self.call::<Value>("removeProduct", json!([caller, hash]))
            .await
            .map(|_| ())
    }

    async fn products_of(&self, address: &Address) -> LedgerResult<Vec<Fingerprint>> {
        self.call("productsOf", json!([address])).await
    }

    async fn total_product_count(&self) -> LedgerResult<u64> {
        self.call("totalProductCount", json!([])).await
    }

    fn subscribe_roles(&self) -> broadcast::Receiver<RoleAssigned> {
        self.roles_tx.subscribe()
    }
}
