use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainsync::assets::{StaticAssetRegistry, XQC_ASSET_ID};
use chainsync::connection::NodeConnection;
use chainsync::convert::Converter;
use chainsync::rpc::{NodeRpc, RpcError};
use chainsync::sync::{ParentGate, SyncConfig, SyncEngine, SyncError};
use chainsync_chainstate::events::BlockEvents;
use chainsync_chainstate::sync_state::SyncStateStore;
use chainsync_chainstate::BlockStore;
use chainsync_primitives::{
    ChainId, Network, NormalizedBlock, RawBlock, RawInput, RawOutput, RawTransaction, TxKind,
};
use chainsync_storage::memory::MemoryStore;
use serde_json::Value;

#[derive(Default)]
struct FakeNode {
    chain: Mutex<Vec<RawBlock>>,
    missing_once: Mutex<HashSet<u64>>,
    known_txs: Mutex<HashMap<String, RawTransaction>>,
    failing_tx_lookups: AtomicUsize,
    failing_counts: AtomicUsize,
    get_block_calls: AtomicUsize,
}

impl FakeNode {
    fn with_blocks(blocks: Vec<RawBlock>) -> Arc<Self> {
        let node = Arc::new(Self::default());
        node.replace(blocks);
        node
    }

    fn replace(&self, blocks: Vec<RawBlock>) {
        *self.chain.lock().expect("chain") = blocks;
    }

    fn push(&self, block: RawBlock) {
        self.chain.lock().expect("chain").push(block);
    }

    fn hide_once(&self, height: u64) {
        self.missing_once.lock().expect("missing").insert(height);
    }

    fn know_tx(&self, tx: RawTransaction) {
        self.known_txs
            .lock()
            .expect("txs")
            .insert(tx.txid.clone(), tx);
    }

    fn fail_tx_lookups(&self, times: usize) {
        self.failing_tx_lookups.store(times, Ordering::SeqCst);
    }

    fn fail_block_counts(&self, times: usize) {
        self.failing_counts.store(times, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.get_block_calls.load(Ordering::SeqCst)
    }
}

impl NodeRpc for FakeNode {
    fn get_block_count(&self) -> Result<u64, RpcError> {
        if take_failure(&self.failing_counts) {
            return Err(RpcError::Transport("connection reset".to_string()));
        }
        Ok(self.chain.lock().expect("chain").len() as u64)
    }

    fn get_block(&self, height: u64) -> Result<Option<RawBlock>, RpcError> {
        self.get_block_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_once.lock().expect("missing").remove(&height) {
            return Ok(None);
        }
        Ok(self
            .chain
            .lock()
            .expect("chain")
            .get(height as usize)
            .cloned())
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<RawTransaction, RpcError> {
        if take_failure(&self.failing_tx_lookups) {
            return Err(RpcError::Transport("timed out".to_string()));
        }
        self.known_txs
            .lock()
            .expect("txs")
            .get(txid)
            .cloned()
            .ok_or_else(|| RpcError::Node {
                code: -100,
                message: format!("unknown transaction {txid}"),
            })
    }

    fn send_raw_transaction(&self, _raw_hex: &str) -> Result<bool, RpcError> {
        Ok(true)
    }

    fn get_asset_state(&self, _asset_id: &str) -> Result<Option<Value>, RpcError> {
        Ok(None)
    }
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

fn raw_block(height: u64, hash: &str, prev: Option<&str>) -> RawBlock {
    RawBlock {
        hash: hash.to_string(),
        size: 100,
        index: height,
        time: 1_500_000_000 + height as i64 * 15,
        previousblockhash: prev.map(str::to_string),
        nextblockhash: None,
        merkleroot: String::new(),
        nonce: "0".to_string(),
        nextconsensus: None,
        tx: vec![RawTransaction {
            txid: format!("tx-{hash}"),
            size: 10,
            kind: TxKind::Miner,
            vin: Vec::new(),
            vout: vec![RawOutput {
                n: 0,
                asset: format!("0x{XQC_ASSET_ID}"),
                value: "1".to_string(),
                address: "Dminer".to_string(),
            }],
            net_fee: "0".to_string(),
            sys_fee: "0".to_string(),
            scripts: Vec::new(),
            nonce: height,
            blockhash: Some(hash.to_string()),
            blocknumber: Some(height),
        }],
    }
}

/// Linear chain `<prefix>0 .. <prefix>{len-1}`.
fn linear(prefix: &str, len: u64) -> Vec<RawBlock> {
    (0..len)
        .map(|height| {
            let hash = format!("{prefix}{height}");
            let prev = height.checked_sub(1).map(|prev| format!("{prefix}{prev}"));
            raw_block(height, &hash, prev.as_deref())
        })
        .collect()
}

fn chain() -> ChainId {
    ChainId::new("XQC", Network::Regtest)
}

struct Harness {
    engine: SyncEngine<MemoryStore>,
    blocks: BlockStore<MemoryStore>,
    sync_state: Arc<SyncStateStore<MemoryStore>>,
    events: Arc<BlockEvents>,
}

fn harness(node: Arc<FakeNode>, configure: impl FnOnce(&mut SyncConfig)) -> Harness {
    let chain = chain();
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(BlockEvents::new());
    let blocks = BlockStore::with_events(Arc::clone(&store), Arc::clone(&events));
    let sync_state = Arc::new(SyncStateStore::new(Arc::clone(&store)));
    let client: Arc<dyn NodeRpc> = node;
    let connection = Arc::new(NodeConnection::with_client(chain.clone(), client));
    let converter = Converter::new(
        chain.clone(),
        Arc::clone(&connection),
        Arc::new(StaticAssetRegistry::with_defaults()),
    );

    let mut config = SyncConfig::new(chain, "http://fake-node");
    config.health_interval = Duration::from_millis(20);
    config.sync_cooldown = Duration::from_millis(20);
    config.error_cooldown = Duration::from_millis(20);
    config.missing_block_wait = Duration::from_millis(10);
    config.parent_wait = Duration::from_millis(10);
    configure(&mut config);

    let engine = SyncEngine::new(
        config,
        connection,
        converter,
        blocks.clone(),
        Arc::clone(&sync_state),
    );
    Harness {
        engine,
        blocks,
        sync_state,
        events,
    }
}

fn stored_hashes(blocks: &BlockStore<MemoryStore>) -> Vec<String> {
    let chain = chain();
    let mut out = Vec::new();
    let mut height = 0;
    while let Some(block) = blocks.block_at(&chain, height).expect("block_at") {
        out.push(block.hash);
        height += 1;
    }
    out
}

#[tokio::test]
async fn pass_ingests_every_remote_block() {
    let node = FakeNode::with_blocks(linear("a", 3));
    let h = harness(Arc::clone(&node), |_| {});

    let report = h.engine.run_pass().await.expect("pass");
    assert_eq!(report.start_height, 0);
    assert_eq!(report.next_height, 3);
    assert_eq!(report.remote_best, Some(2));
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "a2"]);

    let tip = h.engine.local_tip().await.expect("tip").expect("some tip");
    assert_eq!(tip.hash, "a2");
    assert_eq!(tip.height, 2);

    let chain = chain();
    let a1 = h.blocks.block_at(&chain, 1).expect("read").expect("a1");
    assert!(a1.processed);
    assert_eq!(a1.next_block_hash.as_deref(), Some("a2"));
    assert_eq!(a1.time, (1_500_000_000 + 15) * 1000);
    let txs = h
        .blocks
        .transactions()
        .for_block(&chain, "a1")
        .expect("txs");
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].to, "Dminer");
    assert_eq!(txs[0].block_height, Some(1));
    assert_eq!(txs[0].from, None);

    assert!(h.engine.initial_sync_complete());
    assert!(h.sync_state.load().expect("state").is_complete(&chain));
    let metrics = h.engine.metrics();
    assert_eq!(metrics.blocks, 3);
    assert_eq!(metrics.transactions, 3);
    assert_eq!(metrics.passes, 1);

    let calls = node.calls();
    let again = h.engine.run_pass().await.expect("second pass");
    assert_eq!(again.start_height, 3);
    assert_eq!(node.calls(), calls);
}

#[tokio::test]
async fn pass_resumes_after_local_tip() {
    let node = FakeNode::with_blocks(linear("a", 2));
    let h = harness(Arc::clone(&node), |_| {});
    let added = h.events.subscribe();

    h.engine.run_pass().await.expect("first pass");
    assert_eq!(added.try_iter().count(), 0);

    for block in linear("a", 4).into_iter().skip(2) {
        node.push(block);
    }
    let calls = node.calls();
    let report = h.engine.run_pass().await.expect("second pass");
    assert_eq!(report.start_height, 2);
    assert_eq!(node.calls() - calls, 2);
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "a2", "a3"]);

    let signalled: Vec<NormalizedBlock> = added.try_iter().collect();
    assert_eq!(signalled.len(), 2);
    assert_eq!(signalled[0].hash, "a2");
    assert_eq!(signalled[1].hash, "a3");
}

#[tokio::test]
async fn pass_follows_a_reorganized_remote_chain() {
    let node = FakeNode::with_blocks(linear("a", 3));
    let h = harness(Arc::clone(&node), |_| {});
    h.engine.run_pass().await.expect("first pass");

    let mut fork = linear("a", 2);
    fork.push(raw_block(2, "b2", Some("a1")));
    fork.push(raw_block(3, "b3", Some("b2")));
    node.replace(fork);

    let report = h.engine.run_pass().await.expect("reorg pass");
    assert_eq!(report.next_height, 4);
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "b2", "b3"]);
    assert_eq!(h.engine.metrics().reorgs, 1);

    let chain = chain();
    assert!(h.blocks.get_block(&chain, "a2").expect("read").is_none());
    assert!(h
        .blocks
        .transactions()
        .get(&chain, "tx-a2")
        .expect("read")
        .is_none());
    let a1 = h.blocks.block_at(&chain, 1).expect("read").expect("a1");
    assert_eq!(a1.next_block_hash.as_deref(), Some("b2"));
}

#[tokio::test]
async fn missing_block_is_retried() {
    let node = FakeNode::with_blocks(linear("a", 3));
    node.hide_once(1);
    let h = harness(Arc::clone(&node), |_| {});

    h.engine.run_pass().await.expect("pass");
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "a2"]);
    assert_eq!(h.engine.metrics().missing_waits, 1);
    assert_eq!(node.calls(), 4);
}

#[tokio::test]
async fn empty_remote_chain_completes_immediately() {
    let node = FakeNode::with_blocks(Vec::new());
    let h = harness(Arc::clone(&node), |_| {});

    let report = h.engine.run_pass().await.expect("pass");
    assert_eq!(report.remote_best, None);
    assert_eq!(node.calls(), 0);
    assert!(h.engine.initial_sync_complete());
}

#[tokio::test]
async fn parent_chain_gates_the_pass() {
    let node = FakeNode::with_blocks(linear("a", 2));
    let h = harness(Arc::clone(&node), |config| {
        config.parent = Some(ParentGate {
            chain: "BTC".to_string(),
            fork_height: 1,
        });
    });

    let engine = h.engine.clone();
    let waiting = tokio::spawn(async move { engine.run_pass().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());
    assert_eq!(node.calls(), 0);

    let parent = ChainId::new("BTC", Network::Regtest);
    for height in 0..2u64 {
        let block = NormalizedBlock {
            chain: parent.chain.clone(),
            network: parent.network,
            height,
            hash: format!("p{height}"),
            previous_block_hash: height.checked_sub(1).map(|prev| format!("p{prev}")),
            next_block_hash: None,
            time: 1_000 * height as i64,
            time_normalized: 1_000 * height as i64,
            merkle_root: String::new(),
            nonce: String::new(),
            next_consensus: None,
            size: 0,
            transaction_count: 0,
            processed: false,
        };
        h.blocks
            .add_block(&block, &[], false)
            .expect("parent block");
    }

    let report = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("gate opens")
        .expect("join")
        .expect("pass");
    assert_eq!(report.next_height, 2);
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1"]);
}

#[tokio::test]
async fn stop_interrupts_a_waiting_pass() {
    let node = FakeNode::with_blocks(linear("a", 1));
    let h = harness(Arc::clone(&node), |config| {
        config.parent = Some(ParentGate {
            chain: "BTC".to_string(),
            fork_height: 10,
        });
        config.parent_wait = Duration::from_secs(60);
    });

    let engine = h.engine.clone();
    let waiting = tokio::spawn(async move { engine.run_pass().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("stopped in time")
        .expect("join");
    assert!(matches!(result, Err(SyncError::Stopped)));
    assert!(h.engine.is_stopping());
    assert!(!h.engine.sync());
}

#[tokio::test]
async fn sync_runs_one_loop_at_a_time() {
    let node = FakeNode::with_blocks(linear("a", 3));
    let h = harness(Arc::clone(&node), |_| {});

    let done = h.engine.sync_done();
    tokio::pin!(done);
    done.as_mut().enable();

    assert!(h.engine.sync());
    assert!(!h.engine.sync());
    assert!(h.engine.is_syncing());

    tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("sync finished");
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "a2"]);

    h.engine.stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.engine.is_syncing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop exits after stop");
}

#[tokio::test]
async fn start_syncs_and_stops() {
    let node = FakeNode::with_blocks(linear("a", 2));
    let h = harness(Arc::clone(&node), |_| {});

    let done = h.engine.sync_done();
    tokio::pin!(done);
    done.as_mut().enable();

    let listener = h.engine.start();
    tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("first pass finished");
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1"]);

    h.engine.stop();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener exits")
        .expect("join");
}

#[tokio::test]
async fn relays_raw_transactions_and_blocks() {
    let node = FakeNode::with_blocks(linear("a", 2));
    let h = harness(Arc::clone(&node), |_| {});

    assert!(h
        .engine
        .send_raw_transaction("00ff".to_string())
        .await
        .expect("send"));
    let block = h.engine.get_block(1).await.expect("get").expect("block");
    assert_eq!(block.hash, "a1");
    assert!(h.engine.get_block(7).await.expect("get").is_none());
}

#[tokio::test]
async fn failed_ingest_retries_the_same_height() {
    let mut blocks = linear("a", 3);
    let funding = blocks[0].tx[0].clone();
    blocks[1].tx.push(RawTransaction {
        txid: "spend-a1".to_string(),
        size: 20,
        kind: TxKind::Standard("ContractTransaction".to_string()),
        vin: vec![RawInput {
            txid: funding.txid.clone(),
            vout: 0,
        }],
        vout: vec![RawOutput {
            n: 0,
            asset: XQC_ASSET_ID.to_string(),
            value: "0.5".to_string(),
            address: "Dpayee".to_string(),
        }],
        net_fee: "0.001".to_string(),
        sys_fee: "0".to_string(),
        scripts: Vec::new(),
        nonce: 0,
        blockhash: Some("a1".to_string()),
        blocknumber: Some(1),
    });
    let node = FakeNode::with_blocks(blocks);
    node.know_tx(funding);
    node.fail_tx_lookups(2);
    let h = harness(Arc::clone(&node), |_| {});

    let report = h.engine.run_pass().await.expect("pass");
    assert_eq!(report.next_height, 3);
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1", "a2"]);
    let metrics = h.engine.metrics();
    assert_eq!(metrics.failures, 2);
    assert_eq!(metrics.blocks, 3);
    assert_eq!(node.calls(), 5);

    let spend = h
        .blocks
        .transactions()
        .get(&chain(), "spend-a1")
        .expect("read")
        .expect("stored");
    assert_eq!(spend.from.as_deref(), Some("Dminer"));
    assert_eq!(spend.to, "Dpayee");
    assert_eq!(spend.value, 50_000_000);
    assert_eq!(spend.fee, 100_000);
    assert_eq!(spend.transaction_index, 1);
}

#[tokio::test]
async fn failed_pass_is_retried_after_error_cooldown() {
    let node = FakeNode::with_blocks(linear("a", 2));
    node.fail_block_counts(1);
    let h = harness(Arc::clone(&node), |config| {
        config.sync_cooldown = Duration::from_secs(60);
    });

    let err = h.engine.run_pass().await.expect_err("count fails");
    assert!(matches!(err, SyncError::Rpc(_)));
    assert!(stored_hashes(&h.blocks).is_empty());

    node.fail_block_counts(1);
    let done = h.engine.sync_done();
    tokio::pin!(done);
    done.as_mut().enable();
    assert!(h.engine.sync());

    tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("pass after error cooldown");
    assert_eq!(stored_hashes(&h.blocks), vec!["a0", "a1"]);
    assert_eq!(h.engine.metrics().passes, 1);
    assert!(h.engine.is_syncing());

    h.engine.stop();
}
