//! Records as reported by the remote node's JSON-RPC (`getblock <h> 1`,
//! `getrawtransaction <txid> 1`).

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MINER_TRANSACTION: &str = "MinerTransaction";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RawBlock {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    pub index: u64,
    /// Seconds since the unix epoch.
    pub time: i64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    #[serde(default)]
    pub nextblockhash: Option<String>,
    #[serde(default)]
    pub merkleroot: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub nonce: String,
    #[serde(default)]
    pub nextconsensus: Option<String>,
    #[serde(default)]
    pub tx: Vec<RawTransaction>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RawInput {
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RawOutput {
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub asset: String,
    /// Chain-native decimal, e.g. `"1.5"`.
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: TxKind,
    #[serde(default)]
    pub vin: Vec<RawInput>,
    #[serde(default)]
    pub vout: Vec<RawOutput>,
    #[serde(default = "zero_decimal", deserialize_with = "string_or_number")]
    pub net_fee: String,
    #[serde(default = "zero_decimal", deserialize_with = "string_or_number")]
    pub sys_fee: String,
    #[serde(default)]
    pub scripts: Vec<Value>,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default, alias = "blockHash")]
    pub blockhash: Option<String>,
    #[serde(default, alias = "blockNumber")]
    pub blocknumber: Option<u64>,
}

impl RawTransaction {
    pub fn first_output(&self) -> Option<&RawOutput> {
        self.vout.first()
    }
}

/// Transaction type as reported by the node. Miner transactions carry no
/// spendable inputs, every other type names its funding inputs.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum TxKind {
    Miner,
    Standard(String),
}

impl TxKind {
    pub fn as_str(&self) -> &str {
        match self {
            TxKind::Miner => MINER_TRANSACTION,
            TxKind::Standard(name) => name.as_str(),
        }
    }

    pub fn is_miner(&self) -> bool {
        matches!(self, TxKind::Miner)
    }
}

impl Default for TxKind {
    fn default() -> Self {
        TxKind::Standard(String::new())
    }
}

impl From<String> for TxKind {
    fn from(value: String) -> Self {
        if value == MINER_TRANSACTION {
            TxKind::Miner
        } else {
            TxKind::Standard(value)
        }
    }
}

impl From<TxKind> for String {
    fn from(value: TxKind) -> Self {
        match value {
            TxKind::Miner => MINER_TRANSACTION.to_string(),
            TxKind::Standard(name) => name,
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn zero_decimal() -> String {
    "0".to_string()
}

/// Nodes are inconsistent about quoting decimals and nonces; accept both.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrNumber;

    impl<'de> Visitor<'de> for StringOrNumber {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_unit<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
