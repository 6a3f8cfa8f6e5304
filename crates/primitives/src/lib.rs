//! Shared record types: raw node payloads, normalized documents and money.

pub mod block;
pub mod money;
pub mod network;
pub mod raw;
pub mod transaction;

pub use block::NormalizedBlock;
pub use network::{ChainId, Network};
pub use raw::{RawBlock, RawInput, RawOutput, RawTransaction, TxKind};
pub use transaction::{AssetInfo, NormalizedTransaction};
