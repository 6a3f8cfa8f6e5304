//! Persisted chain per chain+network: monotonic normalized time, reorg
//! detection against the local tip, truncation and relinking.

use std::sync::Arc;

use chainsync_log::{log_debug, log_error, log_info};
use chainsync_primitives::{ChainId, NormalizedBlock, NormalizedTransaction};
use chainsync_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::events::BlockEvents;
use crate::index::{ChainIndex, ChainTip};
use crate::txstore::{BlockContext, TransactionStore};

pub const DEFAULT_LOCATOR_LIMIT: usize = 30;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    /// `add_block` rejected the block because the local chain was repaired
    /// and the caller must resume from the new tip.
    Reorg { height: u64, hash: String },
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Reorg { height, hash } => {
                write!(f, "reorg detected while adding block {hash} at height {height}")
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl ChainStateError {
    pub fn is_reorg(&self) -> bool {
        matches!(self, ChainStateError::Reorg { .. })
    }
}

pub struct BlockStore<S: ?Sized> {
    index: ChainIndex<S>,
    txs: TransactionStore<S>,
    events: Arc<BlockEvents>,
}

impl<S: ?Sized> Clone for BlockStore<S> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            txs: self.txs.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<S: KeyValueStore + ?Sized> BlockStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_events(store, Arc::new(BlockEvents::new()))
    }

    pub fn with_events(store: Arc<S>, events: Arc<BlockEvents>) -> Self {
        Self {
            index: ChainIndex::new(Arc::clone(&store)),
            txs: TransactionStore::new(store),
            events,
        }
    }

    pub fn index(&self) -> &ChainIndex<S> {
        &self.index
    }

    pub fn transactions(&self) -> &TransactionStore<S> {
        &self.txs
    }

    pub fn events(&self) -> &Arc<BlockEvents> {
        &self.events
    }

    /// Checks the latest locator header and then the incoming block against
    /// the local tip. A detected reorg truncates the local chain and rejects
    /// the block; otherwise the block and its transactions are persisted.
    pub fn add_block(
        &self,
        block: &NormalizedBlock,
        transactions: &[NormalizedTransaction],
        initial_sync_complete: bool,
    ) -> Result<(), ChainStateError> {
        let chain = block.chain_id();

        let mut reorg = false;
        let headers = self.locator_headers(&chain, DEFAULT_LOCATOR_LIMIT)?;
        if let Some(last) = headers.last() {
            reorg = self.handle_reorg(&chain, Some(last))?;
        }
        reorg = self.handle_reorg(&chain, Some(block))? || reorg;

        if reorg {
            return Err(ChainStateError::Reorg {
                height: block.height,
                hash: block.hash.clone(),
            });
        }
        self.process_block(&chain, block, transactions, initial_sync_complete)
    }

    pub fn process_block(
        &self,
        chain: &ChainId,
        block: &NormalizedBlock,
        transactions: &[NormalizedTransaction],
        initial_sync_complete: bool,
    ) -> Result<(), ChainStateError> {
        let mut converted = self.get_block_op(chain, block)?;
        let previous = match converted.previous_block_hash.as_deref() {
            Some(prev_hash) => self.index.get_block(chain, prev_hash)?,
            None => None,
        };

        let mut batch = WriteBatch::new();
        if let Some(existing) = self.index.height_hash(chain, converted.height)? {
            if existing != converted.hash {
                log_debug!(
                    "replacing block {} at height {} with {} ({})",
                    existing,
                    converted.height,
                    converted.hash,
                    chain
                );
                self.txs.delete_for_block(&mut batch, chain, &existing)?;
                self.index.delete_block(&mut batch, chain, &existing);
            }
        }
        self.index.put_block(&mut batch, chain, &converted)?;
        self.index
            .set_height_hash(&mut batch, chain, converted.height, &converted.hash);
        self.index.write(&batch)?;

        if let Some(mut previous) = previous {
            if previous.next_block_hash.as_deref() != Some(converted.hash.as_str()) {
                previous.next_block_hash = Some(converted.hash.clone());
                let mut link = WriteBatch::new();
                self.index.put_block(&mut link, chain, &previous)?;
                self.index.write(&link)?;
                log_debug!("linked {} -> {}", previous.hash, converted.hash);
            }
        }

        self.txs.batch_import(
            chain,
            BlockContext {
                hash: &converted.hash,
                height: converted.height,
                time: converted.time,
                time_normalized: converted.time_normalized,
            },
            transactions,
        )?;

        if initial_sync_complete {
            self.events.signal_block(&converted);
        }

        converted.processed = true;
        let mut done = WriteBatch::new();
        self.index.put_block(&mut done, chain, &converted)?;
        self.index.set_tip(&mut done, chain, &converted.hash);
        self.index.write(&done)?;
        Ok(())
    }

    /// Upsert document for `block`: every field comes from the incoming
    /// block except `time_normalized`, which is bumped past the predecessor
    /// when the raw time does not advance.
    pub fn get_block_op(
        &self,
        chain: &ChainId,
        block: &NormalizedBlock,
    ) -> Result<NormalizedBlock, ChainStateError> {
        let previous = match block.previous_block_hash.as_deref() {
            Some(prev_hash) => self.index.get_block(chain, prev_hash)?,
            None => None,
        };
        let time_normalized = match previous {
            Some(prev) if block.time <= prev.time_normalized => prev.time_normalized + 1,
            _ => block.time,
        };

        let mut op = block.clone();
        op.chain = chain.chain.clone();
        op.network = chain.network;
        op.time_normalized = time_normalized;
        op.processed = false;
        if op.next_block_hash.is_none() {
            if let Some(existing) = self.index.get_block(chain, &block.hash)? {
                op.next_block_hash = existing.next_block_hash;
            }
        }
        Ok(op)
    }

    /// Returns true when the local chain diverged from `block` and is still
    /// divergent after the repair.
    ///
    /// A locally known parent is kept: truncation starts at
    /// `parent.height + 1`, not at the parent's own height, so `block` can
    /// link to it on the next attempt.
    pub fn handle_reorg(
        &self,
        chain: &ChainId,
        block: Option<&NormalizedBlock>,
    ) -> Result<bool, ChainStateError> {
        let Some(block) = block else {
            return Ok(false);
        };
        let Some(local_tip) = self.index.best_block(chain)? else {
            return Ok(false);
        };
        let prev_hash = block.previous_block_hash.as_deref();
        if prev_hash == Some(local_tip.hash.as_str()) || local_tip.hash == block.hash {
            return Ok(false);
        }
        if local_tip.height == 0 {
            return Ok(false);
        }

        let ancestor = match prev_hash {
            Some(prev_hash) => self.index.get_block(chain, prev_hash)?,
            None => None,
        };
        let (reference, truncate_from) = match ancestor {
            Some(ancestor) => {
                let from = ancestor.height + 1;
                (ancestor, from)
            }
            None => {
                log_error!(
                    "previous block {} of {} at height {} is not stored for {}; rolling back until a common block is found",
                    prev_hash.unwrap_or("<none>"),
                    block.hash,
                    block.height,
                    chain
                );
                let below = match block.height.checked_sub(1) {
                    Some(height) => self.index.block_at(chain, height)?,
                    None => None,
                };
                match below {
                    Some(below) => {
                        let from = below.height;
                        (below, from)
                    }
                    None => {
                        let from = local_tip.height;
                        (local_tip, from)
                    }
                }
            }
        };

        log_info!(
            "resetting {} tip to height {}",
            chain,
            truncate_from.saturating_sub(1)
        );
        self.truncate_from(chain, truncate_from)?;
        Ok(Some(reference.hash.as_str()) != prev_hash)
    }

    /// Deletes every block at `height` or above together with its
    /// transactions, unlinks the block left on top and rewinds the tip.
    pub fn truncate_from(&self, chain: &ChainId, height: u64) -> Result<usize, ChainStateError> {
        let doomed = self.index.heights_from(chain, height)?;
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        let mut removed_txs = 0usize;
        for (doomed_height, hash) in &doomed {
            removed_txs += self.txs.delete_for_block(&mut batch, chain, hash)?;
            self.index.delete_block(&mut batch, chain, hash);
            self.index.clear_height_hash(&mut batch, chain, *doomed_height);
        }

        let mut new_tip = None;
        let mut cursor = height;
        while cursor > 0 {
            cursor -= 1;
            let Some(mut below) = self.index.block_at(chain, cursor)? else {
                continue;
            };
            let points_into_doomed = below
                .next_block_hash
                .as_deref()
                .is_some_and(|next| doomed.iter().any(|(_, hash)| hash == next));
            if points_into_doomed {
                below.next_block_hash = None;
                self.index.put_block(&mut batch, chain, &below)?;
            }
            if below.processed {
                new_tip = Some(below);
                break;
            }
        }

        let tip_height = self.index.best_block(chain)?.map(|tip| tip.height);
        if tip_height.map_or(true, |tip| tip >= height) {
            match &new_tip {
                Some(tip) => self.index.set_tip(&mut batch, chain, &tip.hash),
                None => self.index.clear_tip(&mut batch, chain),
            }
        }
        self.index.write(&batch)?;

        log_info!(
            "removed {} blocks and {} transactions at or above height {} for {}",
            doomed.len(),
            removed_txs,
            height,
            chain
        );
        Ok(doomed.len())
    }

    /// Recent processed blocks ending at the tip, ascending, limited to the
    /// run that links by previous hash.
    pub fn locator_headers(
        &self,
        chain: &ChainId,
        limit: usize,
    ) -> Result<Vec<NormalizedBlock>, ChainStateError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(tip) = self.index.best_block(chain)? else {
            return Ok(Vec::new());
        };
        let mut headers = vec![tip];
        while headers.len() < limit {
            let Some(last) = headers.last() else {
                break;
            };
            let Some(height) = last.height.checked_sub(1) else {
                break;
            };
            match self.index.block_at(chain, height)? {
                Some(block) if block.processed && block.is_parent_of(last) => headers.push(block),
                _ => break,
            }
        }
        headers.reverse();
        Ok(headers)
    }

    pub fn get_local_tip(&self, chain: &ChainId) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.index.best_block(chain)?.as_ref().map(ChainTip::from))
    }

    pub fn get_block(
        &self,
        chain: &ChainId,
        hash: &str,
    ) -> Result<Option<NormalizedBlock>, ChainStateError> {
        Ok(self.index.get_block(chain, hash)?)
    }

    pub fn block_at(
        &self,
        chain: &ChainId,
        height: u64,
    ) -> Result<Option<NormalizedBlock>, ChainStateError> {
        Ok(self.index.block_at(chain, height)?)
    }
}
