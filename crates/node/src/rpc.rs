//! JSON-RPC client for the remote ledger node.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chainsync_primitives::{RawBlock, RawTransaction};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

/// Error code the node answers with for heights it does not know yet.
const UNKNOWN_BLOCK_CODE: i64 = -100;

#[derive(Debug)]
pub enum RpcError {
    Transport(String),
    Http(i32),
    Node { code: i64, message: String },
    Decode(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(message) => write!(f, "rpc transport error: {message}"),
            RpcError::Http(status) => write!(f, "rpc http status {status}"),
            RpcError::Node { code, message } => write!(f, "rpc error {code}: {message}"),
            RpcError::Decode(message) => write!(f, "rpc decode error: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    fn is_unknown_block(&self) -> bool {
        match self {
            RpcError::Node { code, message } => {
                *code == UNKNOWN_BLOCK_CODE || message.to_ascii_lowercase().contains("unknown block")
            }
            _ => false,
        }
    }
}

/// Calls the sync engine makes against the remote node. Implementations
/// block the calling thread.
pub trait NodeRpc: Send + Sync {
    /// Number of blocks the node has, i.e. best height + 1.
    fn get_block_count(&self) -> Result<u64, RpcError>;
    /// `Ok(None)` when the node does not have the height yet.
    fn get_block(&self, height: u64) -> Result<Option<RawBlock>, RpcError>;
    fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError>;
    fn send_raw_transaction(&self, raw_hex: &str) -> Result<bool, RpcError>;
    /// Raw `getassetstate` document, `Ok(None)` for unknown assets.
    fn get_asset_state(&self, asset_id: &str) -> Result<Option<Value>, RpcError>;
}

#[derive(Clone, Debug)]
pub struct RpcClientConfig {
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub timeout_secs: u64,
}

impl RpcClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            pass: None,
            timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
        }
    }
}

pub struct JsonRpcClient {
    config: RpcClientConfig,
    auth_header: Option<String>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(config: RpcClientConfig) -> Self {
        let auth_header = config.user.as_ref().map(|user| {
            let pass = config.pass.as_deref().unwrap_or("");
            format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
        });
        Self {
            config,
            auth_header,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        })
        .to_string();

        let mut request = minreq::post(&self.config.url)
            .with_header("Content-Type", "application/json")
            .with_body(body)
            .with_timeout(self.config.timeout_secs);
        if let Some(auth) = &self.auth_header {
            request = request.with_header("Authorization", auth.as_str());
        }
        let response = request
            .send()
            .map_err(|err| RpcError::Transport(format!("{method}: {err}")))?;
        let status = response.status_code;
        let text = response
            .as_str()
            .map_err(|err| RpcError::Decode(format!("{method}: {err}")))?;

        let envelope: Value = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(_) if !(200..300).contains(&status) => return Err(RpcError::Http(status)),
            Err(err) => return Err(RpcError::Decode(format!("{method}: {err}"))),
        };
        parse_envelope(envelope)
    }

    fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let value = self.call(method, params)?;
        serde_json::from_value(value).map_err(|err| RpcError::Decode(format!("{method}: {err}")))
    }
}

impl NodeRpc for JsonRpcClient {
    fn get_block_count(&self) -> Result<u64, RpcError> {
        let value = self.call("getblockcount", json!([]))?;
        value_as_u64(&value)
            .ok_or_else(|| RpcError::Decode(format!("getblockcount: not a number: {value}")))
    }

    fn get_block(&self, height: u64) -> Result<Option<RawBlock>, RpcError> {
        match self.call("getblock", json!([height, 1])) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| RpcError::Decode(format!("getblock {height}: {err}"))),
            Err(err) if err.is_unknown_block() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
        self.call_typed("getrawtransaction", json!([txid, 1]))
    }

    fn send_raw_transaction(&self, raw_hex: &str) -> Result<bool, RpcError> {
        let value = self.call("sendrawtransaction", json!([raw_hex]))?;
        Ok(match value {
            Value::Bool(accepted) => accepted,
            Value::Null => false,
            _ => true,
        })
    }

    fn get_asset_state(&self, asset_id: &str) -> Result<Option<Value>, RpcError> {
        match self.call("getassetstate", json!([asset_id])) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(RpcError::Node { message, .. })
                if message.to_ascii_lowercase().contains("unknown asset") =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn parse_envelope(envelope: Value) -> Result<Value, RpcError> {
    if let Some(error) = envelope.get("error").filter(|error| !error.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(RpcError::Node { code, message });
    }
    match envelope {
        Value::Object(mut object) => Ok(object.remove("result").unwrap_or(Value::Null)),
        other => Err(RpcError::Decode(format!("unexpected response: {other}"))),
    }
}

/// Accepts `12`, `12.0` and `"12"`.
fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && *float >= 0.0 && float.fract() == 0.0)
                .map(|float| float as u64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
