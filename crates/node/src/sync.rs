//! Tailing sync engine: pulls blocks from the remote node in height order
//! and hands them to the block store, restarting itself after every pass.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chainsync_chainstate::sync_state::SyncStateStore;
use chainsync_chainstate::{BlockStore, ChainStateError, ChainTip};
use chainsync_primitives::{ChainId, RawBlock};
use chainsync_storage::{KeyValueStore, StoreError};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::connection::NodeConnection;
use crate::convert::{ConvertError, Converter};
use crate::health::{HealthMonitor, HealthSignal, DEFAULT_HEALTH_INTERVAL};
use crate::rpc::RpcError;
use crate::stats::{MetricsSnapshot, ProgressLimiter, ProgressReport, SyncMetrics, PROGRESS_INTERVAL};

/// Cross-chain readiness gate: this chain does not sync until the parent
/// chain's local tip reaches `fork_height`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParentGate {
    pub chain: String,
    pub fork_height: u64,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub chain: ChainId,
    /// Shown in connection log lines.
    pub endpoint: String,
    pub parent: Option<ParentGate>,
    pub health_interval: Duration,
    pub sync_cooldown: Duration,
    pub error_cooldown: Duration,
    pub missing_block_wait: Duration,
    pub parent_wait: Duration,
}

impl SyncConfig {
    pub fn new(chain: ChainId, endpoint: impl Into<String>) -> Self {
        Self {
            chain,
            endpoint: endpoint.into(),
            parent: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            sync_cooldown: Duration::from_secs(10),
            error_cooldown: Duration::from_secs(2),
            missing_block_wait: Duration::from_secs(1),
            parent_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum SyncError {
    Rpc(RpcError),
    Store(StoreError),
    Chain(ChainStateError),
    Convert(ConvertError),
    Join(String),
    Stopped,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Rpc(err) => write!(f, "{err}"),
            SyncError::Store(err) => write!(f, "{err}"),
            SyncError::Chain(err) => write!(f, "{err}"),
            SyncError::Convert(err) => write!(f, "{err}"),
            SyncError::Join(message) => write!(f, "sync task failed: {message}"),
            SyncError::Stopped => write!(f, "sync stopped"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<RpcError> for SyncError {
    fn from(err: RpcError) -> Self {
        SyncError::Rpc(err)
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err)
    }
}

impl From<ChainStateError> for SyncError {
    fn from(err: ChainStateError) -> Self {
        SyncError::Chain(err)
    }
}

impl From<ConvertError> for SyncError {
    fn from(err: ConvertError) -> Self {
        SyncError::Convert(err)
    }
}

/// Outcome of one completed catch-up pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PassReport {
    pub start_height: u64,
    /// Next height to fetch once the pass finished.
    pub next_height: u64,
    pub remote_best: Option<u64>,
}

struct Inner<S: ?Sized> {
    config: SyncConfig,
    connection: Arc<NodeConnection>,
    converter: Converter,
    blocks: BlockStore<S>,
    sync_state: Arc<SyncStateStore<S>>,
    metrics: SyncMetrics,
    syncing: AtomicBool,
    stopping: AtomicBool,
    initial_sync_complete: AtomicBool,
    sync_done: Notify,
    stop_tx: watch::Sender<bool>,
    health_halt: Mutex<Option<watch::Sender<bool>>>,
    signals: mpsc::UnboundedSender<HealthSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<HealthSignal>>>,
}

/// One engine per chain+network. Cloning shares the engine.
pub struct SyncEngine<S: ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> SyncEngine<S> {
    pub fn new(
        config: SyncConfig,
        connection: Arc<NodeConnection>,
        converter: Converter,
        blocks: BlockStore<S>,
        sync_state: Arc<SyncStateStore<S>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                connection,
                converter,
                blocks,
                sync_state,
                metrics: SyncMetrics::default(),
                syncing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                initial_sync_complete: AtomicBool::new(false),
                sync_done: Notify::new(),
                stop_tx,
                health_halt: Mutex::new(None),
                signals,
                signal_rx: Mutex::new(Some(signal_rx)),
            }),
        }
    }

    pub fn chain(&self) -> &ChainId {
        &self.inner.config.chain
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn blocks(&self) -> &BlockStore<S> {
        &self.inner.blocks
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub fn initial_sync_complete(&self) -> bool {
        self.inner.initial_sync_complete.load(Ordering::SeqCst)
    }

    /// Starts health monitoring, the `connected` listener and a first pass.
    /// The returned handle finishes once the engine is stopped.
    pub fn start(&self) -> JoinHandle<()> {
        log_debug!("Started worker for chain {}", self.chain());
        self.connect();
        let listener = self.spawn_listener();
        self.sync();
        listener
    }

    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        log_debug!("Stopping worker for chain {}", self.chain());
        self.inner.stop_tx.send_replace(true);
        self.disconnect();
    }

    /// Spawns the health monitor unless one is already running.
    pub fn connect(&self) {
        let Ok(mut halt) = self.inner.health_halt.lock() else {
            return;
        };
        if halt.is_some() {
            return;
        }
        let (halt_tx, halt_rx) = watch::channel(false);
        HealthMonitor::new(
            Arc::clone(&self.inner.connection),
            self.inner.config.endpoint.clone(),
            self.inner.config.health_interval,
            self.inner.signals.clone(),
            halt_rx,
        )
        .spawn();
        *halt = Some(halt_tx);
    }

    pub fn disconnect(&self) {
        let halt = self
            .inner
            .health_halt
            .lock()
            .ok()
            .and_then(|mut halt| halt.take());
        if let Some(halt) = halt {
            halt.send_replace(true);
        }
    }

    /// Starts the self-rescheduling sync loop. Returns false when a loop is
    /// already running or the engine is stopping.
    pub fn sync(&self) -> bool {
        if self.is_stopping() {
            return false;
        }
        if self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let cooldown = match engine.run_pass().await {
                    Ok(_) => {
                        log_info!("{} up to date.", engine.chain());
                        engine.inner.config.sync_cooldown
                    }
                    Err(SyncError::Stopped) => break,
                    Err(err) => {
                        log_error!(
                            "Error syncing {} {}: {}",
                            engine.chain().chain,
                            engine.chain().network,
                            err
                        );
                        engine.inner.config.error_cooldown
                    }
                };
                if engine.pause(cooldown).await {
                    break;
                }
            }
            engine.inner.syncing.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Resolves the next time a pass catches up with the remote tip.
    pub fn sync_done(&self) -> Notified<'_> {
        self.inner.sync_done.notified()
    }

    /// Fetches a raw block through the cached client.
    pub async fn get_block(&self, height: u64) -> Result<Option<RawBlock>, SyncError> {
        Ok(self
            .inner
            .connection
            .call(move |client| client.get_block(height))
            .await?)
    }

    pub async fn send_raw_transaction(&self, raw_hex: String) -> Result<bool, SyncError> {
        Ok(self
            .inner
            .connection
            .call(move |client| client.send_raw_transaction(&raw_hex))
            .await?)
    }

    pub async fn local_tip(&self) -> Result<Option<ChainTip>, SyncError> {
        self.blocking(|inner| Ok(inner.blocks.get_local_tip(&inner.config.chain)?))
            .await
    }

    /// One catch-up pass: ingest every height from the local tip up to the
    /// remote best, then mark the chain as initially synced.
    pub async fn run_pass(&self) -> Result<PassReport, SyncError> {
        if self.is_stopping() {
            return Err(SyncError::Stopped);
        }
        let chain = self.chain().clone();
        let state = self.blocking(|inner| Ok(inner.sync_state.load()?)).await?;
        self.inner
            .initial_sync_complete
            .store(state.is_complete(&chain), Ordering::SeqCst);

        let tip = self.local_tip().await?;
        self.wait_for_parent(tip.as_ref()).await?;

        let start_height = next_height(tip.as_ref());
        let started = Instant::now();
        let mut best = self.remote_best().await?;
        let mut current = start_height;
        log_info!(
            "Syncing {} blocks for {} {}",
            best.map_or(0, |best| (best + 1).saturating_sub(current)),
            chain.chain,
            chain.network
        );

        let mut progress = ProgressLimiter::new(PROGRESS_INTERVAL);
        while let Some(best_height) = best.filter(|best| current <= *best) {
            if self.is_stopping() {
                return Err(SyncError::Stopped);
            }
            let Some(raw) = self.get_block(current).await? else {
                self.inner.metrics.record_missing_wait();
                log_debug!("{}: block {} not available yet", chain, current);
                if self.pause(self.inner.config.missing_block_wait).await {
                    return Err(SyncError::Stopped);
                }
                continue;
            };

            match self.ingest(raw).await {
                Ok(()) => {}
                Err(SyncError::Chain(err)) if err.is_reorg() => {
                    self.inner.metrics.record_reorg();
                    log_info!("{}: {}", chain, err);
                }
                Err(err) => {
                    self.inner.metrics.record_failure();
                    log_warn!("{}: failed to ingest block {}: {}", chain, current, err);
                    if self.pause(self.inner.config.missing_block_wait).await {
                        return Err(SyncError::Stopped);
                    }
                }
            }

            if current == best_height {
                best = self.remote_best().await?;
            }
            current = next_height(self.local_tip().await?.as_ref());

            if progress.ready(Instant::now()) {
                let report = ProgressReport {
                    chain: chain.clone(),
                    blocks: current.saturating_sub(start_height),
                    elapsed: started.elapsed(),
                    height: current,
                };
                log_info!("{}", report);
            }
        }

        let fresh = self
            .blocking(|inner| Ok(inner.sync_state.mark_complete(&inner.config.chain)?))
            .await?;
        if fresh {
            log_info!("{}: initial sync complete", chain);
        }
        self.inner
            .initial_sync_complete
            .store(true, Ordering::SeqCst);
        self.inner.metrics.record_pass();
        self.inner.sync_done.notify_waiters();
        Ok(PassReport {
            start_height,
            next_height: current,
            remote_best: best,
        })
    }

    async fn ingest(&self, raw: RawBlock) -> Result<(), SyncError> {
        let converted = self.inner.converter.convert_block(raw).await?;
        let initial_sync_complete = self.initial_sync_complete();
        let height = converted.block.height;
        let tx_count = converted.transactions.len() as u64;
        self.blocking(move |inner| {
            inner.blocks.add_block(
                &converted.block,
                &converted.transactions,
                initial_sync_complete,
            )?;
            Ok(())
        })
        .await?;
        self.inner.metrics.record_block(height, tx_count);
        Ok(())
    }

    async fn wait_for_parent(&self, tip: Option<&ChainTip>) -> Result<(), SyncError> {
        let Some(parent) = self.inner.config.parent.clone() else {
            return Ok(());
        };
        if tip.is_some_and(|tip| tip.height >= parent.fork_height) {
            return Ok(());
        }
        let parent_chain = ChainId::new(parent.chain.clone(), self.chain().network);
        loop {
            let lookup = parent_chain.clone();
            let parent_tip = self
                .blocking(move |inner| Ok(inner.blocks.get_local_tip(&lookup)?))
                .await?;
            if parent_tip.is_some_and(|tip| tip.height >= parent.fork_height) {
                return Ok(());
            }
            log_info!(
                "Waiting until {} syncs before {} {}",
                parent.chain,
                self.chain().chain,
                self.chain().network
            );
            if self.pause(self.inner.config.parent_wait).await {
                return Err(SyncError::Stopped);
            }
        }
    }

    async fn remote_best(&self) -> Result<Option<u64>, SyncError> {
        let count = self
            .inner
            .connection
            .call(|client| client.get_block_count())
            .await?;
        Ok(count.checked_sub(1))
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let signals = self
            .inner
            .signal_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take());
        let mut stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(async move {
            let Some(mut signals) = signals else {
                log_debug!("{}: listener already running", engine.chain());
                return;
            };
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(HealthSignal::Connected) => {
                            if !engine.is_syncing() {
                                engine.sync();
                            }
                        }
                        Some(HealthSignal::Disconnected) => {}
                        None => break,
                    },
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Sleeps for `duration`; returns true when a stop arrived meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopping(),
            _ = stop_rx.changed() => true,
        }
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner<S>) -> Result<T, SyncError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|err| SyncError::Join(err.to_string()))?
    }
}

fn next_height(tip: Option<&ChainTip>) -> u64 {
    tip.map_or(0, |tip| tip.height + 1)
}
