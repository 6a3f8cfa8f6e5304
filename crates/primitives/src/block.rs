use serde::{Deserialize, Serialize};

use crate::network::{ChainId, Network};

/// Block document as persisted by the block store. Times are unix
/// milliseconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedBlock {
    pub chain: String,
    pub network: Network,
    pub height: u64,
    pub hash: String,
    #[serde(default)]
    pub previous_block_hash: Option<String>,
    /// Maintained by the store when the successor is linked.
    #[serde(default)]
    pub next_block_hash: Option<String>,
    pub time: i64,
    pub time_normalized: i64,
    #[serde(default)]
    pub merkle_root: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub next_consensus: Option<String>,
    pub size: u64,
    pub transaction_count: u64,
    #[serde(default)]
    pub processed: bool,
}

impl NormalizedBlock {
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.chain.clone(), self.network)
    }

    /// True when `other` names this block as its parent.
    pub fn is_parent_of(&self, other: &NormalizedBlock) -> bool {
        other.previous_block_hash.as_deref() == Some(self.hash.as_str())
    }
}
