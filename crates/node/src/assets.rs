//! Asset metadata lookups keyed by network and asset id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chainsync_primitives::{AssetInfo, Network};
use serde_json::Value;

use crate::connection::NodeConnection;
use crate::rpc::RpcError;

pub const GOVERNING_TOKEN: &str = "GoverningToken";
pub const XQC_ASSET_ID: &str = "52a4b58d99af84e0ca33318f3724e92c14835d97af46714a4a68a098a3843276";

#[derive(Debug)]
pub enum AssetError {
    NotFound(String),
    Rpc(RpcError),
    Invalid(String),
}

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetError::NotFound(id) => write!(f, "unknown asset {id}"),
            AssetError::Rpc(err) => write!(f, "asset lookup failed: {err}"),
            AssetError::Invalid(message) => write!(f, "invalid asset state: {message}"),
        }
    }
}

impl std::error::Error for AssetError {}

impl From<RpcError> for AssetError {
    fn from(err: RpcError) -> Self {
        AssetError::Rpc(err)
    }
}

pub trait AssetRegistry: Send + Sync {
    /// `asset_id` is bare hex, without a `0x` prefix.
    fn asset_info(&self, network: Network, asset_id: &str) -> Result<AssetInfo, AssetError>;
}

/// Normalizes user and node supplied ids to lowercase bare hex.
pub fn normalize_asset_id(asset_id: &str) -> String {
    let trimmed = asset_id.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// Fixed entries, valid on every network.
#[derive(Clone, Debug, Default)]
pub struct StaticAssetRegistry {
    entries: HashMap<String, AssetInfo>,
}

impl StaticAssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert(XQC_ASSET_ID, AssetInfo::new(GOVERNING_TOKEN, "XQC", "XQC"));
        registry
    }

    pub fn insert(&mut self, asset_id: &str, info: AssetInfo) {
        self.entries.insert(normalize_asset_id(asset_id), info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AssetRegistry for StaticAssetRegistry {
    fn asset_info(&self, _network: Network, asset_id: &str) -> Result<AssetInfo, AssetError> {
        let id = normalize_asset_id(asset_id);
        self.entries
            .get(&id)
            .cloned()
            .ok_or(AssetError::NotFound(id))
    }
}

/// Parses `--asset <id>=<type>:<symbol>:<name>`.
pub fn parse_asset_entry(raw: &str) -> Result<(String, AssetInfo), String> {
    let (id, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid asset '{raw}' (expected <id>=<type>:<symbol>:<name>)"))?;
    let id = normalize_asset_id(id);
    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(format!("invalid asset id in '{raw}'"));
    }
    let mut parts = rest.splitn(3, ':');
    let kind = parts.next().unwrap_or("").trim();
    let symbol = parts.next().unwrap_or("").trim();
    let name = parts.next().unwrap_or(symbol).trim();
    if kind.is_empty() || symbol.is_empty() {
        return Err(format!(
            "invalid asset '{raw}' (expected <id>=<type>:<symbol>:<name>)"
        ));
    }
    Ok((id, AssetInfo::new(kind, symbol, name)))
}

/// Reads `getassetstate` from the node and caches the result.
pub struct NodeAssetRegistry {
    connection: Arc<NodeConnection>,
    cache: Mutex<HashMap<(Network, String), AssetInfo>>,
}

impl NodeAssetRegistry {
    pub fn new(connection: Arc<NodeConnection>) -> Self {
        Self {
            connection,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl AssetRegistry for NodeAssetRegistry {
    fn asset_info(&self, network: Network, asset_id: &str) -> Result<AssetInfo, AssetError> {
        let id = normalize_asset_id(asset_id);
        let key = (network, id.clone());
        if let Ok(cache) = self.cache.lock() {
            if let Some(info) = cache.get(&key) {
                return Ok(info.clone());
            }
        }

        let client = self.connection.current()?;
        let state = client
            .get_asset_state(&format!("0x{id}"))?
            .ok_or_else(|| AssetError::NotFound(id.clone()))?;
        let info = asset_from_state(&state)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, info.clone());
        }
        Ok(info)
    }
}

/// Tries each registry in order and returns the first hit. A registry that
/// fails with anything other than `NotFound` stops the search.
pub struct FallbackAssetRegistry {
    registries: Vec<Arc<dyn AssetRegistry>>,
}

impl FallbackAssetRegistry {
    pub fn new(registries: Vec<Arc<dyn AssetRegistry>>) -> Self {
        Self { registries }
    }
}

impl AssetRegistry for FallbackAssetRegistry {
    fn asset_info(&self, network: Network, asset_id: &str) -> Result<AssetInfo, AssetError> {
        for registry in &self.registries {
            match registry.asset_info(network, asset_id) {
                Err(AssetError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(AssetError::NotFound(normalize_asset_id(asset_id)))
    }
}

fn asset_from_state(state: &Value) -> Result<AssetInfo, AssetError> {
    let kind = state
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AssetError::Invalid("missing type".to_string()))?;
    let name = match state.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Array(names)) => localized_name(names)
            .ok_or_else(|| AssetError::Invalid("empty name list".to_string()))?,
        _ => return Err(AssetError::Invalid("missing name".to_string())),
    };
    let symbol = state
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());
    Ok(AssetInfo::new(kind, symbol, name))
}

/// Prefers the English entry of a `[{lang, name}]` list.
fn localized_name(names: &[Value]) -> Option<String> {
    let named = |entry: &Value| entry.get("name").and_then(Value::as_str).map(str::to_string);
    names
        .iter()
        .find(|entry| {
            entry
                .get("lang")
                .and_then(Value::as_str)
                .is_some_and(|lang| lang.to_ascii_lowercase().starts_with("en"))
        })
        .and_then(named)
        .or_else(|| names.iter().find_map(named))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn governing_token_is_preregistered() {
        let registry = StaticAssetRegistry::with_defaults();
        let info = registry
            .asset_info(Network::Testnet, &format!("0x{}", XQC_ASSET_ID.to_uppercase()))
            .expect("xqc");
        assert_eq!(info.kind, GOVERNING_TOKEN);
        assert_eq!(info.symbol, "XQC");
        assert!(matches!(
            registry.asset_info(Network::Mainnet, "abcd"),
            Err(AssetError::NotFound(id)) if id == "abcd"
        ));
    }

    #[test]
    fn asset_entry_parsing() {
        let (id, info) = parse_asset_entry("0xABCD=UtilityToken:XQG:Quras Gas").expect("entry");
        assert_eq!(id, "abcd");
        assert_eq!(info, AssetInfo::new("UtilityToken", "XQG", "Quras Gas"));

        let (_, short) = parse_asset_entry("ff=Token:TKN").expect("short");
        assert_eq!(short.name, "TKN");

        assert!(parse_asset_entry("nothex=Token:TKN").is_err());
        assert!(parse_asset_entry("ff").is_err());
        assert!(parse_asset_entry("ff=Token").is_err());
    }

    #[test]
    fn node_state_names() {
        let state = json!({
            "type": "GoverningToken",
            "name": [{"lang": "zh-CN", "name": "量子币"}, {"lang": "en", "name": "Quras"}]
        });
        let info = asset_from_state(&state).expect("state");
        assert_eq!(info.name, "Quras");
        assert_eq!(info.symbol, "Quras");

        let state = json!({"type": "Token", "name": "Thing", "symbol": "THG"});
        let info = asset_from_state(&state).expect("state");
        assert_eq!(info, AssetInfo::new("Token", "THG", "Thing"));

        assert!(matches!(
            asset_from_state(&json!({"name": "x"})),
            Err(AssetError::Invalid(_))
        ));
    }

    struct Failing;

    impl AssetRegistry for Failing {
        fn asset_info(&self, _network: Network, _asset_id: &str) -> Result<AssetInfo, AssetError> {
            Err(AssetError::Rpc(RpcError::Transport("down".to_string())))
        }
    }

    #[test]
    fn fallback_stops_on_hard_errors() {
        let registry = FallbackAssetRegistry::new(vec![
            Arc::new(StaticAssetRegistry::with_defaults()),
            Arc::new(Failing),
        ]);
        assert!(registry.asset_info(Network::Mainnet, XQC_ASSET_ID).is_ok());
        assert!(matches!(
            registry.asset_info(Network::Mainnet, "abcd"),
            Err(AssetError::Rpc(_))
        ));
    }
}
