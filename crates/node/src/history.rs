//! Wallet transaction history over stored transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chainsync_chainstate::txstore::TransactionStore;
use chainsync_primitives::money::Amount;
use chainsync_primitives::{AssetInfo, ChainId, NormalizedTransaction};
use chainsync_storage::{KeyValueStore, StoreError};
use serde::Serialize;
use serde_json::Value;

use crate::assets::GOVERNING_TOKEN;

/// Membership of addresses in wallets, maintained outside the sync engine.
pub trait WalletAddressBook {
    fn count_addresses_for_wallet(&self, wallet: &str, address: &str) -> usize;
}

#[derive(Clone, Debug, Default)]
pub struct AddressBook {
    wallets: BTreeMap<String, BTreeSet<String>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wallet: impl Into<String>, address: impl Into<String>) {
        self.wallets
            .entry(wallet.into())
            .or_default()
            .insert(address.into());
    }

    pub fn first_address(&self, wallet: &str) -> Option<&str> {
        self.wallets
            .get(wallet)
            .and_then(|addresses| addresses.iter().next())
            .map(String::as_str)
    }
}

impl WalletAddressBook for AddressBook {
    fn count_addresses_for_wallet(&self, wallet: &str, address: &str) -> usize {
        self.wallets
            .get(wallet)
            .map_or(0, |addresses| usize::from(addresses.contains(address)))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Send,
    Move,
    Receive,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub txid: String,
    pub fee: Amount,
    pub category: Category,
    pub satoshis: Amount,
    pub height: Option<u64>,
    pub from: Option<String>,
    pub address: String,
    pub block_time: Option<i64>,
    pub scripts: Vec<Value>,
    pub asset: Option<AssetInfo>,
}

/// Stored values are already in smallest units; sends are reported
/// negative. Transactions touching none of the wallet's addresses yield
/// `None`.
pub fn classify<B: WalletAddressBook + ?Sized>(
    tx: &NormalizedTransaction,
    wallet: &str,
    book: &B,
) -> Option<HistoryEntry> {
    let ours = |address: &str| book.count_addresses_for_wallet(wallet, address) > 0;
    let sending = tx.from.as_deref().is_some_and(ours);
    let (category, satoshis) = if sending {
        if ours(&tx.to) {
            (Category::Move, tx.value)
        } else {
            (Category::Send, -tx.value)
        }
    } else if ours(&tx.to) {
        (Category::Receive, tx.value)
    } else {
        return None;
    };

    Some(HistoryEntry {
        txid: tx.txid.clone(),
        fee: tx.fee,
        category,
        satoshis,
        height: tx.block_height,
        from: tx.from.clone(),
        address: tx.to.clone(),
        block_time: tx.block_time_normalized,
        scripts: tx.scripts.clone(),
        asset: tx.asset.clone(),
    })
}

#[derive(Clone, Debug, Default)]
pub struct HistoryQuery {
    pub wallet: Option<String>,
    pub address: Option<String>,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    /// Unix milliseconds, inclusive.
    pub start_date: Option<i64>,
    /// Unix milliseconds, exclusive.
    pub end_date: Option<i64>,
}

impl HistoryQuery {
    /// A block range, when given, takes precedence over the date range.
    fn matches_range(&self, tx: &NormalizedTransaction) -> bool {
        if self.start_block.is_some() || self.end_block.is_some() {
            let Some(height) = tx.block_height else {
                return false;
            };
            return self.start_block.map_or(true, |start| height >= start)
                && self.end_block.map_or(true, |end| height <= end);
        }
        if self.start_date.is_none() && self.end_date.is_none() {
            return true;
        }
        let Some(time) = tx.block_time_normalized else {
            return false;
        };
        self.start_date.map_or(true, |start| time >= start)
            && self.end_date.map_or(true, |end| time < end)
    }
}

#[derive(Debug)]
pub enum HistoryError {
    MissingWallet,
    Store(StoreError),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::MissingWallet => write!(f, "wallet id is required"),
            HistoryError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<StoreError> for HistoryError {
    fn from(err: StoreError) -> Self {
        HistoryError::Store(err)
    }
}

/// Governing-token transactions of `wallet` (by wallet tag or by `address`
/// as sender or recipient), ordered by normalized block time and rendered as
/// newline-terminated JSON lines.
pub fn wallet_history<S, B>(
    txs: &TransactionStore<S>,
    chain: &ChainId,
    query: &HistoryQuery,
    book: &B,
) -> Result<Vec<String>, HistoryError>
where
    S: KeyValueStore + ?Sized,
    B: WalletAddressBook + ?Sized,
{
    let wallet = query
        .wallet
        .as_deref()
        .filter(|wallet| !wallet.is_empty())
        .ok_or(HistoryError::MissingWallet)?;
    let address = query.address.as_deref();

    let mut matched = Vec::new();
    txs.for_each(chain, |tx| {
        let governing = tx
            .asset
            .as_ref()
            .is_some_and(|asset| asset.kind == GOVERNING_TOKEN);
        let member = tx.wallets.contains(wallet)
            || address.is_some_and(|address| {
                tx.to == address || tx.from.as_deref() == Some(address)
            });
        if governing && member && query.matches_range(&tx) {
            matched.push(tx);
        }
        Ok(())
    })?;
    matched.sort_by(|a, b| {
        a.block_time_normalized
            .cmp(&b.block_time_normalized)
            .then(a.block_height.cmp(&b.block_height))
            .then(a.transaction_index.cmp(&b.transaction_index))
    });

    let mut lines = Vec::with_capacity(matched.len());
    for tx in &matched {
        if let Some(entry) = classify(tx, wallet, book) {
            let json = serde_json::to_string(&entry)
                .map_err(|err| StoreError::Backend(format!("encode history entry: {err}")))?;
            lines.push(format!("{json}\n"));
        }
    }
    Ok(lines)
}
