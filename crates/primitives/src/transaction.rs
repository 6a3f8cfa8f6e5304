use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::money::Amount;
use crate::network::{ChainId, Network};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssetInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub symbol: String,
    pub name: String,
}

impl AssetInfo {
    pub fn new(kind: impl Into<String>, symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            symbol: symbol.into(),
            name: name.into(),
        }
    }
}

/// Transaction document. `block_*` fields are `None` until the transaction
/// is imported together with its owning block.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTransaction {
    pub chain: String,
    pub network: Network,
    pub txid: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub block_time_normalized: Option<i64>,
    #[serde(default)]
    pub transaction_index: u32,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: String,
    pub value: Amount,
    pub fee: Amount,
    #[serde(default)]
    pub asset: Option<AssetInfo>,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub scripts: Vec<Value>,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub wallets: BTreeSet<String>,
}

impl NormalizedTransaction {
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.chain.clone(), self.network)
    }

    pub fn is_confirmed(&self) -> bool {
        self.block_hash.is_some()
    }

    /// Overlays the owning block's identity and times.
    pub fn attach_block(&mut self, hash: &str, height: u64, time: i64, time_normalized: i64) {
        self.block_hash = Some(hash.to_string());
        self.block_height = Some(height);
        self.block_time = Some(time);
        self.block_time_normalized = Some(time_normalized);
    }
}
