//! Persisted chain state: blocks, transactions, tip pointer and sync flags.

pub mod blocks;
pub mod events;
pub mod index;
pub mod sync_state;
pub mod txstore;

pub use blocks::{BlockStore, ChainStateError};
pub use index::ChainTip;
