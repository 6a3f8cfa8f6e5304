//! Transaction documents keyed by `(chain, network, txid)` plus the
//! block -> txid membership used to drop a block's transactions on reorg.

use std::sync::Arc;

use chainsync_primitives::{ChainId, NormalizedTransaction};
use chainsync_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// Owning-block fields overlaid on every imported transaction.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext<'a> {
    pub hash: &'a str,
    pub height: u64,
    pub time: i64,
    pub time_normalized: i64,
}

pub struct TransactionStore<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for TransactionStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore + ?Sized> TransactionStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Upserts every transaction of a block. Re-importing the same txid
    /// replaces the document but keeps the wallets already attached to it.
    pub fn batch_import(
        &self,
        chain: &ChainId,
        block: BlockContext<'_>,
        txs: &[NormalizedTransaction],
    ) -> Result<usize, StoreError> {
        if txs.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for (position, tx) in txs.iter().enumerate() {
            let mut doc = tx.clone();
            doc.chain = chain.chain.clone();
            doc.network = chain.network;
            doc.transaction_index = u32::try_from(position).unwrap_or(u32::MAX);
            doc.attach_block(block.hash, block.height, block.time, block.time_normalized);
            if let Some(existing) = self.get(chain, &doc.txid)? {
                doc.wallets.extend(existing.wallets);
            }
            batch.put(Column::Transaction, tx_key(chain, &doc.txid), encode_tx(&doc)?);
            batch.put(
                Column::BlockTransactions,
                membership_key(chain, block.hash, &doc.txid),
                b"",
            );
        }
        self.store.write_batch(&batch)?;
        Ok(txs.len())
    }

    /// Queues deletion of a block's transactions into `batch`. A transaction
    /// that has since been re-imported under a different block is left alone.
    pub fn delete_for_block(
        &self,
        batch: &mut WriteBatch,
        chain: &ChainId,
        block_hash: &str,
    ) -> Result<usize, StoreError> {
        let prefix = membership_prefix(chain, block_hash);
        let mut removed = 0usize;
        for (key, _) in self.store.scan_prefix(Column::BlockTransactions, &prefix)? {
            let txid = decode_txid(&key[prefix.len()..])?;
            let owned = match self.get(chain, &txid)? {
                Some(tx) => tx.block_hash.as_deref() == Some(block_hash),
                None => false,
            };
            if owned {
                batch.delete(Column::Transaction, tx_key(chain, &txid));
                removed += 1;
            }
            batch.delete(Column::BlockTransactions, key);
        }
        Ok(removed)
    }

    pub fn get(
        &self,
        chain: &ChainId,
        txid: &str,
    ) -> Result<Option<NormalizedTransaction>, StoreError> {
        match self.store.get(Column::Transaction, &tx_key(chain, txid))? {
            Some(bytes) => decode_tx(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Transactions of one block in their in-block order.
    pub fn for_block(
        &self,
        chain: &ChainId,
        block_hash: &str,
    ) -> Result<Vec<NormalizedTransaction>, StoreError> {
        let prefix = membership_prefix(chain, block_hash);
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix(Column::BlockTransactions, &prefix)? {
            let txid = decode_txid(&key[prefix.len()..])?;
            if let Some(tx) = self.get(chain, &txid)? {
                out.push(tx);
            }
        }
        out.sort_by_key(|tx| tx.transaction_index);
        Ok(out)
    }

    pub fn for_each<F>(&self, chain: &ChainId, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(NormalizedTransaction) -> Result<(), StoreError>,
    {
        let prefix = chain.key_prefix();
        self.store
            .for_each_prefix(Column::Transaction, &prefix, &mut |_, value| {
                visit(decode_tx(value)?)
            })
    }

    /// Records that `wallet` owns `txid`; wallet assignment happens outside
    /// the sync pipeline.
    pub fn add_wallet(&self, chain: &ChainId, txid: &str, wallet: &str) -> Result<bool, StoreError> {
        let Some(mut tx) = self.get(chain, txid)? else {
            return Ok(false);
        };
        if !tx.wallets.insert(wallet.to_string()) {
            return Ok(true);
        }
        self.store
            .put(Column::Transaction, &tx_key(chain, txid), &encode_tx(&tx)?)?;
        Ok(true)
    }
}

fn tx_key(chain: &ChainId, txid: &str) -> Vec<u8> {
    let mut key = chain.key_prefix();
    key.extend_from_slice(txid.as_bytes());
    key
}

fn membership_prefix(chain: &ChainId, block_hash: &str) -> Vec<u8> {
    let mut key = chain.key_prefix();
    key.extend_from_slice(block_hash.as_bytes());
    key.push(b'/');
    key
}

fn membership_key(chain: &ChainId, block_hash: &str, txid: &str) -> Vec<u8> {
    let mut key = membership_prefix(chain, block_hash);
    key.extend_from_slice(txid.as_bytes());
    key
}

fn encode_tx(tx: &NormalizedTransaction) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(tx).map_err(|err| StoreError::Backend(format!("encode tx entry: {err}")))
}

fn decode_tx(bytes: &[u8]) -> Result<NormalizedTransaction, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|err| StoreError::Backend(format!("invalid tx entry: {err}")))
}

fn decode_txid(bytes: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::Backend("invalid txid in block membership".to_string()))
}
