//! Height index, hash-keyed block documents and the per-chain tip pointer.

use std::sync::Arc;

use chainsync_primitives::{ChainId, NormalizedBlock};
use chainsync_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_TIP_SUFFIX: &[u8] = b"tip";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: String,
    pub height: u64,
    pub time_normalized: i64,
}

impl From<&NormalizedBlock> for ChainTip {
    fn from(block: &NormalizedBlock) -> Self {
        Self {
            hash: block.hash.clone(),
            height: block.height,
            time_normalized: block.time_normalized,
        }
    }
}

pub struct ChainIndex<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for ChainIndex<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore + ?Sized> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get_block(
        &self,
        chain: &ChainId,
        hash: &str,
    ) -> Result<Option<NormalizedBlock>, StoreError> {
        let bytes = match self.store.get(Column::Block, &block_key(chain, hash))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode_block(&bytes).map(Some)
    }

    pub fn put_block(
        &self,
        batch: &mut WriteBatch,
        chain: &ChainId,
        block: &NormalizedBlock,
    ) -> Result<(), StoreError> {
        batch.put(Column::Block, block_key(chain, &block.hash), encode_block(block)?);
        Ok(())
    }

    pub fn delete_block(&self, batch: &mut WriteBatch, chain: &ChainId, hash: &str) {
        batch.delete(Column::Block, block_key(chain, hash));
    }

    pub fn height_hash(&self, chain: &ChainId, height: u64) -> Result<Option<String>, StoreError> {
        let bytes = match self.store.get(Column::HeightIndex, &height_key(chain, height))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode_hash(&bytes).map(Some)
    }

    pub fn block_at(
        &self,
        chain: &ChainId,
        height: u64,
    ) -> Result<Option<NormalizedBlock>, StoreError> {
        match self.height_hash(chain, height)? {
            Some(hash) => self.get_block(chain, &hash),
            None => Ok(None),
        }
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, chain: &ChainId, height: u64, hash: &str) {
        batch.put(Column::HeightIndex, height_key(chain, height), hash.as_bytes());
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, chain: &ChainId, height: u64) {
        batch.delete(Column::HeightIndex, height_key(chain, height));
    }

    /// `(height, hash)` pairs at or above `from`, ascending.
    pub fn heights_from(
        &self,
        chain: &ChainId,
        from: u64,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        let prefix = chain.key_prefix();
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Column::HeightIndex, &prefix, &mut |key, value| {
                let height = decode_height(&key[prefix.len()..])?;
                if height >= from {
                    out.push((height, decode_hash(value)?));
                }
                Ok(())
            })?;
        Ok(out)
    }

    /// Highest indexed height, processed or not.
    pub fn highest_height(&self, chain: &ChainId) -> Result<Option<u64>, StoreError> {
        let prefix = chain.key_prefix();
        match self.store.last_with_prefix(Column::HeightIndex, &prefix)? {
            Some((key, _)) => decode_height(&key[prefix.len()..]).map(Some),
            None => Ok(None),
        }
    }

    pub fn tip_hash(&self, chain: &ChainId) -> Result<Option<String>, StoreError> {
        match self.store.get(Column::Meta, &tip_key(chain))? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_tip(&self, batch: &mut WriteBatch, chain: &ChainId, hash: &str) {
        batch.put(Column::Meta, tip_key(chain), hash.as_bytes());
    }

    pub fn clear_tip(&self, batch: &mut WriteBatch, chain: &ChainId) {
        batch.delete(Column::Meta, tip_key(chain));
    }

    pub fn best_block(&self, chain: &ChainId) -> Result<Option<NormalizedBlock>, StoreError> {
        match self.tip_hash(chain)? {
            Some(hash) => self.get_block(chain, &hash),
            None => Ok(None),
        }
    }

    pub fn write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

pub fn block_key(chain: &ChainId, hash: &str) -> Vec<u8> {
    let mut key = chain.key_prefix();
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Big-endian so byte order matches height order.
pub fn height_key(chain: &ChainId, height: u64) -> Vec<u8> {
    let mut key = chain.key_prefix();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn tip_key(chain: &ChainId) -> Vec<u8> {
    let mut key = chain.key_prefix();
    key.extend_from_slice(META_TIP_SUFFIX);
    key
}

fn encode_block(block: &NormalizedBlock) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(block)
        .map_err(|err| StoreError::Backend(format!("encode block entry: {err}")))
}

fn decode_block(bytes: &[u8]) -> Result<NormalizedBlock, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|err| StoreError::Backend(format!("invalid block entry: {err}")))
}

fn decode_height(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Backend("invalid height key".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_hash(bytes: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::Backend("invalid block hash entry".to_string()))
}
