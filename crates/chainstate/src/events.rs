use std::sync::Mutex;

use chainsync_primitives::NormalizedBlock;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Fan-out of newly connected blocks to downstream consumers. Only blocks
/// ingested after the initial sync completed are announced.
#[derive(Default)]
pub struct BlockEvents {
    subscribers: Mutex<Vec<Sender<NormalizedBlock>>>,
}

impl BlockEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<NormalizedBlock> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Sends `block` to every live subscriber and drops the ones that hung up.
    pub fn signal_block(&self, block: &NormalizedBlock) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(block.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}
