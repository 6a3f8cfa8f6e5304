//! Raw node records to normalized block and transaction documents.

use std::fmt;
use std::sync::Arc;

use chainsync_primitives::money::{parse_amount, AmountError};
use chainsync_primitives::{
    ChainId, NormalizedBlock, NormalizedTransaction, RawBlock, RawTransaction,
};
use tokio::task::JoinSet;

use crate::assets::{normalize_asset_id, AssetError, AssetRegistry};
use crate::connection::NodeConnection;
use crate::rpc::RpcError;

#[derive(Debug)]
pub enum ConvertError {
    Rpc(RpcError),
    Asset { txid: String, source: AssetError },
    Amount {
        txid: String,
        field: &'static str,
        source: AmountError,
    },
    Join(String),
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::Rpc(err) => write!(f, "{err}"),
            ConvertError::Asset { txid, source } => write!(f, "tx {txid}: {source}"),
            ConvertError::Amount {
                txid,
                field,
                source,
            } => write!(f, "tx {txid}: {field}: {source}"),
            ConvertError::Join(message) => write!(f, "conversion task failed: {message}"),
        }
    }
}

impl std::error::Error for ConvertError {}

impl From<RpcError> for ConvertError {
    fn from(err: RpcError) -> Self {
        ConvertError::Rpc(err)
    }
}

#[derive(Clone, Debug)]
pub struct ConvertedBlock {
    pub block: NormalizedBlock,
    pub transactions: Vec<NormalizedTransaction>,
}

#[derive(Clone)]
pub struct Converter {
    chain: ChainId,
    connection: Arc<NodeConnection>,
    assets: Arc<dyn AssetRegistry>,
}

impl Converter {
    pub fn new(chain: ChainId, connection: Arc<NodeConnection>, assets: Arc<dyn AssetRegistry>) -> Self {
        Self {
            chain,
            connection,
            assets,
        }
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    /// Converts the block header synchronously and every transaction on the
    /// blocking pool. Output keeps the node's transaction order.
    /// `time_normalized` equals `time` here; the block store adjusts it.
    pub async fn convert_block(&self, raw: RawBlock) -> Result<ConvertedBlock, ConvertError> {
        let RawBlock {
            hash,
            size,
            index,
            time,
            previousblockhash,
            nextblockhash: _,
            merkleroot,
            nonce,
            nextconsensus,
            tx,
        } = raw;
        let time = time.saturating_mul(1000);
        let block = NormalizedBlock {
            chain: self.chain.chain.clone(),
            network: self.chain.network,
            height: index,
            hash,
            previous_block_hash: previousblockhash,
            next_block_hash: None,
            time,
            time_normalized: time,
            merkle_root: merkleroot,
            nonce,
            next_consensus: nextconsensus,
            size,
            transaction_count: tx.len() as u64,
            processed: false,
        };

        let count = tx.len();
        let mut tasks = JoinSet::new();
        for (position, raw_tx) in tx.into_iter().enumerate() {
            let converter = self.clone();
            let owner = block.clone();
            tasks.spawn_blocking(move || {
                (position, converter.convert_tx(&raw_tx, Some(&owner)))
            });
        }

        let mut slots: Vec<Option<NormalizedTransaction>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            let (position, converted) =
                joined.map_err(|err| ConvertError::Join(err.to_string()))?;
            slots[position] = Some(converted?);
        }
        let transactions = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ConvertError::Join("missing converted transaction".to_string()))?;
        Ok(ConvertedBlock {
            block,
            transactions,
        })
    }

    /// Converts one transaction. Blocks on the previous-output lookup and the
    /// asset registry. With `block`, the owning block's identity and times
    /// are overlaid on the block-independent fields.
    pub fn convert_tx(
        &self,
        raw: &RawTransaction,
        block: Option<&NormalizedBlock>,
    ) -> Result<NormalizedTransaction, ConvertError> {
        let Some(block) = block else {
            return self.convert_standalone(raw);
        };
        let mut tx = self.convert_standalone(raw)?;
        tx.attach_block(&block.hash, block.height, block.time, block.time_normalized);
        Ok(tx)
    }

    fn convert_standalone(&self, raw: &RawTransaction) -> Result<NormalizedTransaction, ConvertError> {
        let from = self.resolve_from(raw)?;
        let output = raw.first_output();

        let asset = match output.map(|out| out.asset.as_str()).filter(|id| !id.is_empty()) {
            Some(asset_id) => Some(
                self.assets
                    .asset_info(self.chain.network, &normalize_asset_id(asset_id))
                    .map_err(|source| ConvertError::Asset {
                        txid: raw.txid.clone(),
                        source,
                    })?,
            ),
            None => None,
        };
        let value = match output {
            Some(out) => parse_amount(&out.value).map_err(|source| ConvertError::Amount {
                txid: raw.txid.clone(),
                field: "value",
                source,
            })?,
            None => 0,
        };
        let fee = parse_amount(&raw.net_fee).map_err(|source| ConvertError::Amount {
            txid: raw.txid.clone(),
            field: "net_fee",
            source,
        })?;

        Ok(NormalizedTransaction {
            chain: self.chain.chain.clone(),
            network: self.chain.network,
            txid: raw.txid.clone(),
            block_hash: raw.blockhash.clone(),
            block_height: raw.blocknumber,
            block_time: None,
            block_time_normalized: None,
            transaction_index: 0,
            from,
            to: output.map(|out| out.address.clone()).unwrap_or_default(),
            value,
            fee,
            asset,
            nonce: raw.nonce,
            scripts: raw.scripts.clone(),
            size: raw.size,
            kind: raw.kind.as_str().to_string(),
            wallets: Default::default(),
        })
    }

    /// Address of the first output of the transaction funding the first
    /// input. Miner transactions have no sender.
    fn resolve_from(&self, raw: &RawTransaction) -> Result<Option<String>, ConvertError> {
        if raw.kind.is_miner() {
            return Ok(None);
        }
        let Some(input) = raw.vin.first() else {
            return Ok(None);
        };
        let client = self.connection.current()?;
        let previous = client.get_raw_transaction(&input.txid)?;
        Ok(previous
            .first_output()
            .map(|out| out.address.clone())
            .filter(|address| !address.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chainsync_primitives::{AssetInfo, Network, RawInput, RawOutput, TxKind};
    use serde_json::Value;

    use crate::assets::{StaticAssetRegistry, GOVERNING_TOKEN, XQC_ASSET_ID};
    use crate::rpc::NodeRpc;

    #[derive(Default)]
    struct PrevTxNode {
        txs: HashMap<String, RawTransaction>,
    }

    impl NodeRpc for PrevTxNode {
        fn get_block_count(&self) -> Result<u64, RpcError> {
            Ok(0)
        }

        fn get_block(&self, _height: u64) -> Result<Option<RawBlock>, RpcError> {
            Ok(None)
        }

        fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
            self.txs.get(txid).cloned().ok_or_else(|| RpcError::Node {
                code: -5,
                message: format!("Unknown transaction {txid}"),
            })
        }

        fn send_raw_transaction(&self, _raw_hex: &str) -> Result<bool, RpcError> {
            Ok(true)
        }

        fn get_asset_state(&self, _asset_id: &str) -> Result<Option<Value>, RpcError> {
            Ok(None)
        }
    }

    fn output(address: &str, asset: &str, value: &str) -> RawOutput {
        RawOutput {
            n: 0,
            asset: asset.to_string(),
            value: value.to_string(),
            address: address.to_string(),
        }
    }

    fn raw_tx(txid: &str, kind: TxKind, vin: Vec<RawInput>, vout: Vec<RawOutput>) -> RawTransaction {
        RawTransaction {
            txid: txid.to_string(),
            size: 120,
            kind,
            vin,
            vout,
            net_fee: "0.001".to_string(),
            sys_fee: "0".to_string(),
            scripts: Vec::new(),
            nonce: 7,
            blockhash: None,
            blocknumber: None,
        }
    }

    fn converter(node: PrevTxNode) -> Converter {
        let chain = ChainId::new("XQC", Network::Mainnet);
        let connection = Arc::new(NodeConnection::with_client(chain.clone(), Arc::new(node)));
        Converter::new(chain, connection, Arc::new(StaticAssetRegistry::with_defaults()))
    }

    #[test]
    fn standalone_conversion_resolves_sender_and_scales_amounts() {
        let mut node = PrevTxNode::default();
        node.txs.insert(
            "funding".to_string(),
            raw_tx(
                "funding",
                TxKind::Standard("ContractTransaction".to_string()),
                Vec::new(),
                vec![output("Dsender", "", "5")],
            ),
        );
        let converter = converter(node);
        let tx = raw_tx(
            "spend",
            TxKind::Standard("ContractTransaction".to_string()),
            vec![RawInput {
                txid: "funding".to_string(),
                vout: 0,
            }],
            vec![output("Dreceiver", &format!("0x{XQC_ASSET_ID}"), "1.5")],
        );

        let converted = converter.convert_tx(&tx, None).expect("convert");
        assert_eq!(converted.from.as_deref(), Some("Dsender"));
        assert_eq!(converted.to, "Dreceiver");
        assert_eq!(converted.value, 150_000_000);
        assert_eq!(converted.fee, 100_000);
        assert_eq!(
            converted.asset,
            Some(AssetInfo::new(GOVERNING_TOKEN, "XQC", "XQC"))
        );
        assert_eq!(converted.kind, "ContractTransaction");
        assert!(converted.block_hash.is_none());
        assert!(converted.block_time.is_none());
    }

    #[test]
    fn miner_transactions_have_no_sender() {
        let converter = converter(PrevTxNode::default());
        let tx = raw_tx(
            "coinbase",
            TxKind::Miner,
            vec![RawInput {
                txid: "ignored".to_string(),
                vout: 0,
            }],
            vec![output("Dminer", "", "0")],
        );
        let converted = converter.convert_tx(&tx, None).expect("convert");
        assert!(converted.from.is_none());
        assert!(converted.asset.is_none());
        assert_eq!(converted.value, 0);
    }

    #[test]
    fn unknown_asset_is_a_hard_error() {
        let converter = converter(PrevTxNode::default());
        let tx = raw_tx(
            "odd",
            TxKind::Miner,
            Vec::new(),
            vec![output("Dx", "0xdeadbeef", "1")],
        );
        let err = converter.convert_tx(&tx, None).expect_err("asset");
        assert!(matches!(
            err,
            ConvertError::Asset { ref txid, source: AssetError::NotFound(_) } if txid == "odd"
        ));
    }

    #[test]
    fn missing_funding_transaction_fails_conversion() {
        let converter = converter(PrevTxNode::default());
        let tx = raw_tx(
            "spend",
            TxKind::Standard("ContractTransaction".to_string()),
            vec![RawInput {
                txid: "gone".to_string(),
                vout: 0,
            }],
            vec![output("Dx", "", "1")],
        );
        assert!(matches!(
            converter.convert_tx(&tx, None),
            Err(ConvertError::Rpc(RpcError::Node { code: -5, .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn block_conversion_keeps_order_and_overlays_block_fields() {
        let converter = converter(PrevTxNode::default());
        let txs = (0..6)
            .map(|i| {
                raw_tx(
                    &format!("tx{i}"),
                    TxKind::Miner,
                    Vec::new(),
                    vec![output("Dminer", "", &i.to_string())],
                )
            })
            .collect::<Vec<_>>();
        let raw = RawBlock {
            hash: "b12".to_string(),
            size: 900,
            index: 12,
            time: 1_600_000_000,
            previousblockhash: Some("b11".to_string()),
            nextblockhash: Some("b13".to_string()),
            merkleroot: "root".to_string(),
            nonce: "42".to_string(),
            nextconsensus: None,
            tx: txs,
        };

        let converted = converter.convert_block(raw).await.expect("block");
        let block = &converted.block;
        assert_eq!(block.time, 1_600_000_000_000);
        assert_eq!(block.time_normalized, block.time);
        assert_eq!(block.height, 12);
        assert_eq!(block.transaction_count, 6);
        assert!(block.next_block_hash.is_none());
        assert!(!block.processed);

        let ids = converted
            .transactions
            .iter()
            .map(|tx| tx.txid.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["tx0", "tx1", "tx2", "tx3", "tx4", "tx5"]);
        for (i, tx) in converted.transactions.iter().enumerate() {
            assert_eq!(tx.block_hash.as_deref(), Some("b12"));
            assert_eq!(tx.block_height, Some(12));
            assert_eq!(tx.block_time, Some(1_600_000_000_000));
            assert_eq!(tx.value, i as i64 * 100_000_000);
        }
    }
}
