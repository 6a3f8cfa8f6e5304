//! Process-wide sync bookkeeping shared by every chain+network.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chainsync_primitives::ChainId;
use chainsync_storage::{Column, KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};

const META_SYNC_STATE_KEY: &[u8] = b"sync_state";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// `"chain:network"` entries that have caught up with the remote tip at
    /// least once.
    #[serde(default)]
    pub initial_sync_complete: BTreeSet<String>,
}

impl SyncState {
    pub fn is_complete(&self, chain: &ChainId) -> bool {
        self.initial_sync_complete.contains(&chain.to_string())
    }
}

pub struct SyncStateStore<S: ?Sized> {
    store: Arc<S>,
    update_lock: Mutex<()>,
}

impl<S: KeyValueStore + ?Sized> SyncStateStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            update_lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<SyncState, StoreError> {
        match self.store.get(Column::Meta, META_SYNC_STATE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Backend(format!("invalid sync state: {err}"))),
            None => Ok(SyncState::default()),
        }
    }

    /// Set-adds `chain`. Returns true when the entry was not present yet.
    pub fn mark_complete(&self, chain: &ChainId) -> Result<bool, StoreError> {
        let _guard = self
            .update_lock
            .lock()
            .map_err(|_| StoreError::Backend("sync state lock poisoned".to_string()))?;
        let mut state = self.load()?;
        if !state.initial_sync_complete.insert(chain.to_string()) {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(&state)
            .map_err(|err| StoreError::Backend(format!("encode sync state: {err}")))?;
        self.store.put(Column::Meta, META_SYNC_STATE_KEY, &bytes)?;
        Ok(true)
    }
}
