use chainsync_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod assets;
pub mod connection;
pub mod convert;
pub mod health;
pub mod history;
pub mod rpc;
pub mod stats;
pub mod sync;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chainsync_chainstate::events::BlockEvents;
use chainsync_chainstate::sync_state::SyncStateStore;
use chainsync_chainstate::BlockStore;
use chainsync_primitives::{AssetInfo, ChainId, Network};
use chainsync_storage::fjall::{FjallOptions, FjallStore};
use chainsync_storage::memory::MemoryStore;
use chainsync_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use fs2::FileExt;

use crate::assets::{
    parse_asset_entry, AssetRegistry, FallbackAssetRegistry, NodeAssetRegistry, StaticAssetRegistry,
};
use crate::connection::NodeConnection;
use crate::convert::Converter;
use crate::history::{AddressBook, HistoryQuery};
use crate::rpc::{RpcClientConfig, DEFAULT_RPC_TIMEOUT_SECS};
use crate::sync::{ParentGate, SyncConfig, SyncEngine};

const DEFAULT_CHAIN: &str = "XQC";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_CONF_FILE_NAME: &str = "chainsync.conf";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2_000;
const DEFAULT_SYNC_COOLDOWN_SECS: u64 = 10;
const DEFAULT_ERROR_COOLDOWN_SECS: u64 = 2;
const DEFAULT_MISSING_BLOCK_WAIT_MS: u64 = 1_000;
const DEFAULT_PARENT_WAIT_SECS: u64 = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

fn default_rpc_url(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "http://127.0.0.1:10332",
        Network::Testnet => "http://127.0.0.1:20332",
        Network::Regtest => "http://127.0.0.1:30332",
    }
}

#[derive(Debug)]
struct Config {
    backend: Backend,
    data_dir: PathBuf,
    conf_path: PathBuf,
    chain: String,
    network: Network,
    rpc_url: String,
    rpc_user: Option<String>,
    rpc_pass: Option<String>,
    rpc_timeout_secs: u64,
    parent: Option<ParentGate>,
    health_interval: Duration,
    sync_cooldown: Duration,
    error_cooldown: Duration,
    missing_block_wait: Duration,
    parent_wait: Duration,
    assets: Vec<(String, AssetInfo)>,
    db_cache_bytes: Option<u64>,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
}

impl Config {
    fn chain_id(&self) -> ChainId {
        ChainId::new(self.chain.clone(), self.network)
    }

    fn rpc_client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            url: self.rpc_url.clone(),
            user: self.rpc_user.clone(),
            pass: self.rpc_pass.clone(),
            timeout_secs: self.rpc_timeout_secs,
        }
    }

    fn sync_config(&self) -> SyncConfig {
        let mut sync = SyncConfig::new(self.chain_id(), self.rpc_url.clone());
        sync.parent = self.parent.clone();
        sync.health_interval = self.health_interval;
        sync.sync_cooldown = self.sync_cooldown;
        sync.error_cooldown = self.error_cooldown;
        sync.missing_block_wait = self.missing_block_wait;
        sync.parent_wait = self.parent_wait;
        sync
    }
}

enum CliAction {
    Run(Config),
    History {
        config: Config,
        query: HistoryQuery,
        book: AddressBook,
    },
    PrintHelp,
    PrintVersion,
}

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        match self {
            Store::Memory(store) => store.last_with_prefix(column, prefix),
            Store::Fjall(store) => store.last_with_prefix(column, prefix),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another chainsyncd instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another chainsyncd instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: config.db_cache_bytes,
                ..FjallOptions::default()
            };
            let db_path = config.data_dir.join("db");
            Ok(Store::Fjall(
                FjallStore::open_with_options(&db_path, options).map_err(|err| err.to_string())?,
            ))
        }
    }
}

fn init_logging(config: &Config) {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("chainsyncd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::History {
            config,
            query,
            book,
        } => run_history(config, query, book).await,
        CliAction::Run(config) => run_with_config(config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    init_logging(&config);
    log_info!(
        "Startup: begin (chain={}, network={}, backend={:?}, rpc={}, data_dir={})",
        config.chain,
        config.network,
        config.backend,
        config.rpc_url,
        config.data_dir.display()
    );

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;
    let store = Arc::new(open_store(&config)?);

    let chain = config.chain_id();
    let events = Arc::new(BlockEvents::new());
    let blocks = BlockStore::with_events(Arc::clone(&store), Arc::clone(&events));
    let sync_state = Arc::new(SyncStateStore::new(Arc::clone(&store)));
    let connection = Arc::new(NodeConnection::from_config(
        chain.clone(),
        config.rpc_client_config(),
    ));

    let mut static_assets = StaticAssetRegistry::with_defaults();
    for (asset_id, info) in &config.assets {
        static_assets.insert(asset_id, info.clone());
    }
    let assets: Arc<dyn AssetRegistry> = Arc::new(FallbackAssetRegistry::new(vec![
        Arc::new(static_assets),
        Arc::new(NodeAssetRegistry::new(Arc::clone(&connection))),
    ]));
    let converter = Converter::new(chain.clone(), Arc::clone(&connection), assets);

    let engine = SyncEngine::new(
        config.sync_config(),
        connection,
        converter,
        blocks,
        sync_state,
    );

    let added = events.subscribe();
    let event_thread = thread::Builder::new()
        .name("block-events".to_string())
        .spawn(move || {
            for block in added.iter() {
                log_info!(
                    "Added block {} at height {} ({}:{})",
                    block.hash,
                    block.height,
                    block.chain,
                    block.network
                );
            }
        })
        .map_err(|err| format!("failed to spawn block event thread: {err}"))?;

    match engine.local_tip().await {
        Ok(Some(tip)) => log_info!("Startup: local tip {} at height {}", tip.hash, tip.height),
        Ok(None) => log_info!("Startup: no local blocks for {}", chain),
        Err(err) => log_warn!("Startup: failed to read local tip: {}", err),
    }

    let listener = engine.start();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                log_warn!("failed to listen for shutdown signal: {}", err);
            }
            log_info!("Shutdown requested");
        }
        _ = listener => {}
    }
    engine.stop();
    log_info!("Shutdown: {}", engine.metrics().to_json());

    drop(engine);
    drop(events);
    if event_thread.is_finished() {
        let _ = event_thread.join();
    }
    Ok(())
}

async fn run_history(config: Config, query: HistoryQuery, book: AddressBook) -> Result<(), String> {
    init_logging(&config);
    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;
    let store = Arc::new(open_store(&config)?);
    let chain = config.chain_id();

    let lines = tokio::task::spawn_blocking(move || {
        let blocks = BlockStore::new(store);
        history::wallet_history(blocks.transactions(), &chain, &query, &book)
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("history task failed: {err}"))??;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        out.write_all(line.as_bytes())
            .map_err(|err| format!("failed to write history: {err}"))?;
    }
    out.flush().map_err(|err| err.to_string())?;
    Ok(())
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {what} '{value}'"))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut chain: Option<String> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut rpc_url: Option<String> = None;
    let mut rpc_user: Option<String> = None;
    let mut rpc_pass: Option<String> = None;
    let mut rpc_timeout_secs: Option<u64> = None;
    let mut parent_chain: Option<String> = None;
    let mut fork_height: Option<u64> = None;
    let mut health_interval_ms = DEFAULT_HEALTH_INTERVAL_MS;
    let mut sync_cooldown_secs = DEFAULT_SYNC_COOLDOWN_SECS;
    let mut error_cooldown_secs = DEFAULT_ERROR_COOLDOWN_SECS;
    let mut missing_block_wait_ms = DEFAULT_MISSING_BLOCK_WAIT_MS;
    let mut parent_wait_secs = DEFAULT_PARENT_WAIT_SECS;
    let mut assets: Vec<(String, AssetInfo)> = Vec::new();
    let mut db_cache_mb: Option<u64> = None;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut history = false;
    let mut query = HistoryQuery::default();
    let mut book = AddressBook::new();
    let mut wallet_addresses: Vec<String> = Vec::new();

    let mut args = raw_args.into_iter().peekable();
    if let Some(first) = args.peek() {
        match first.as_str() {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            "history" => {
                history = true;
                args.next();
            }
            "run" => {
                args.next();
            }
            _ => {}
        }
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--chain" => {
                let value = next_value(&mut args, "--chain")?;
                if value.trim().is_empty() {
                    return Err(format!("chain must not be empty\n{}", usage()));
                }
                chain = Some(value.trim().to_string());
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Network::parse(&value).ok_or_else(|| {
                    format!(
                        "invalid network '{value}' (expected mainnet|testnet|regtest)\n{}",
                        usage()
                    )
                })?;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--rpc-url" | "--rpcurl" => {
                rpc_url = Some(next_value(&mut args, "--rpc-url")?);
            }
            "--rpc-user" | "--rpcuser" => {
                rpc_user = Some(next_value(&mut args, "--rpc-user")?);
            }
            "--rpc-pass" | "--rpcpassword" => {
                rpc_pass = Some(next_value(&mut args, "--rpc-pass")?);
            }
            "--rpc-timeout-secs" => {
                let value = next_value(&mut args, "--rpc-timeout-secs")?;
                let secs = parse_number::<u64>(&value, "rpc timeout")?;
                if secs == 0 {
                    return Err(format!("rpc timeout must be > 0\n{}", usage()));
                }
                rpc_timeout_secs = Some(secs);
            }
            "--parent-chain" => {
                parent_chain = Some(next_value(&mut args, "--parent-chain")?);
            }
            "--fork-height" => {
                let value = next_value(&mut args, "--fork-height")?;
                fork_height = Some(parse_number(&value, "fork height")?);
            }
            "--health-interval-ms" => {
                let value = next_value(&mut args, "--health-interval-ms")?;
                health_interval_ms = parse_number(&value, "health interval")?;
                if health_interval_ms == 0 {
                    return Err(format!("health interval must be > 0\n{}", usage()));
                }
            }
            "--sync-cooldown-secs" => {
                let value = next_value(&mut args, "--sync-cooldown-secs")?;
                sync_cooldown_secs = parse_number(&value, "sync cooldown")?;
            }
            "--error-cooldown-secs" => {
                let value = next_value(&mut args, "--error-cooldown-secs")?;
                error_cooldown_secs = parse_number(&value, "error cooldown")?;
            }
            "--missing-block-wait-ms" => {
                let value = next_value(&mut args, "--missing-block-wait-ms")?;
                missing_block_wait_ms = parse_number(&value, "missing block wait")?;
            }
            "--parent-wait-secs" => {
                let value = next_value(&mut args, "--parent-wait-secs")?;
                parent_wait_secs = parse_number(&value, "parent wait")?;
            }
            "--asset" => {
                let value = next_value(&mut args, "--asset")?;
                assets.push(parse_asset_entry(&value)?);
            }
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = Some(parse_number(&value, "db cache size")?);
            }
            "--log-level" | "--loglevel" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" | "--logformat" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" | "--logtimestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" | "--no-logtimestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--wallet" => {
                query.wallet = Some(next_value(&mut args, "--wallet")?);
            }
            "--address" => {
                query.address = Some(next_value(&mut args, "--address")?);
            }
            "--wallet-address" => {
                wallet_addresses.push(next_value(&mut args, "--wallet-address")?);
            }
            "--start-block" => {
                let value = next_value(&mut args, "--start-block")?;
                query.start_block = Some(parse_number(&value, "start block")?);
            }
            "--end-block" => {
                let value = next_value(&mut args, "--end-block")?;
                query.end_block = Some(parse_number(&value, "end block")?);
            }
            "--start-date" => {
                let value = next_value(&mut args, "--start-date")?;
                query.start_date = Some(parse_number(&value, "start date")?);
            }
            "--end-date" => {
                let value = next_value(&mut args, "--end-date")?;
                query.end_date = Some(parse_number(&value, "end date")?);
            }
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(DEFAULT_CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let last = |key: &str| conf.get(key).and_then(|values| values.last()).cloned();
        let bad = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());

        if !network_set {
            if let Some(raw) = last("network") {
                network = Network::parse(&raw).ok_or_else(|| bad("network", &raw))?;
            } else if let Some(raw) = last("regtest") {
                if parse_conf_bool(&raw).ok_or_else(|| bad("regtest", &raw))? {
                    network = Network::Regtest;
                }
            }
            if network == Network::Mainnet {
                if let Some(raw) = last("testnet") {
                    if parse_conf_bool(&raw).ok_or_else(|| bad("testnet", &raw))? {
                        network = Network::Testnet;
                    }
                }
            }
        }
        if chain.is_none() {
            chain = last("chain");
        }
        if rpc_url.is_none() {
            rpc_url = last("rpcurl");
        }
        if rpc_user.is_none() {
            rpc_user = last("rpcuser");
        }
        if rpc_pass.is_none() {
            rpc_pass = last("rpcpassword");
        }
        if rpc_timeout_secs.is_none() {
            if let Some(raw) = last("rpctimeout") {
                rpc_timeout_secs = Some(parse_number(&raw, "rpctimeout")?);
            }
        }
        if parent_chain.is_none() {
            parent_chain = last("parentchain");
        }
        if fork_height.is_none() {
            if let Some(raw) = last("forkheight") {
                fork_height = Some(parse_number(&raw, "forkheight")?);
            }
        }
        if let Some(values) = conf.get("asset") {
            for value in values {
                assets.push(parse_asset_entry(value)?);
            }
        }
        if !log_level_set {
            if let Some(raw) = last("loglevel") {
                log_level = logging::Level::parse(&raw).ok_or_else(|| bad("loglevel", &raw))?;
            }
        }
        if !log_format_set {
            if let Some(raw) = last("logformat") {
                log_format = logging::Format::parse(&raw).ok_or_else(|| bad("logformat", &raw))?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = last("logtimestamps") {
                log_timestamps =
                    parse_conf_bool(&raw).ok_or_else(|| bad("logtimestamps", &raw))?;
            }
        }
    }

    let parent = match (parent_chain, fork_height) {
        (Some(chain), Some(fork_height)) => Some(ParentGate { chain, fork_height }),
        (None, None) => None,
        _ => {
            return Err(format!(
                "--parent-chain and --fork-height must be given together\n{}",
                usage()
            ))
        }
    };

    let config = Config {
        backend,
        data_dir,
        conf_path: conf_file,
        chain: chain.unwrap_or_else(|| DEFAULT_CHAIN.to_string()),
        network,
        rpc_url: rpc_url.unwrap_or_else(|| default_rpc_url(network).to_string()),
        rpc_user,
        rpc_pass,
        rpc_timeout_secs: rpc_timeout_secs.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
        parent,
        health_interval: Duration::from_millis(health_interval_ms),
        sync_cooldown: Duration::from_secs(sync_cooldown_secs),
        error_cooldown: Duration::from_secs(error_cooldown_secs),
        missing_block_wait: Duration::from_millis(missing_block_wait_ms),
        parent_wait: Duration::from_secs(parent_wait_secs),
        assets,
        db_cache_bytes: db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        log_level,
        log_format,
        log_timestamps,
    };

    if !history {
        return Ok(CliAction::Run(config));
    }
    if query.wallet.is_none() {
        return Err(format!("history requires --wallet\n{}", usage()));
    }
    let wallet = query.wallet.clone().unwrap_or_default();
    for address in wallet_addresses {
        book.insert(wallet.clone(), address);
    }
    if query.address.is_none() {
        query.address = book.first_address(&wallet).map(str::to_string);
    }
    Ok(CliAction::History {
        config,
        query,
        book,
    })
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn usage() -> String {
    [
        "Usage:",
        "  chainsyncd [options]",
        "  chainsyncd <command> [options]",
        "",
        "Commands:",
        "  run      Tail the remote node into the local store (default)",
        "  history  Print a wallet's governing-token history as JSON lines",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/chainsync.conf)",
        "  --chain  Chain ticker (default: XQC)",
        "  --network  mainnet|testnet|regtest (default: mainnet)",
        "  --testnet, --regtest  Shorthands for --network",
        "  --rpc-url  Remote node JSON-RPC endpoint (default: http://127.0.0.1:10332 on mainnet)",
        "  --rpc-user, --rpc-pass  Remote node basic auth credentials",
        "  --rpc-timeout-secs  Remote node request timeout (default: 30)",
        "  --parent-chain  Chain that must reach --fork-height before this one syncs",
        "  --fork-height  Parent chain height gate (requires --parent-chain)",
        "  --health-interval-ms  Remote node probe interval (default: 2000)",
        "  --sync-cooldown-secs  Pause after a completed pass (default: 10)",
        "  --error-cooldown-secs  Pause after a failed pass (default: 2)",
        "  --missing-block-wait-ms  Retry delay for blocks the node lacks (default: 1000)",
        "  --parent-wait-secs  Poll interval while waiting for the parent chain (default: 5)",
        "  --asset  <id>=<type>:<symbol>:<name>  Register asset metadata (repeatable)",
        "  --db-cache-mb  Fjall block cache size",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "",
        "History options:",
        "  --wallet  Wallet id (required)",
        "  --address  Wallet address matched as sender or recipient",
        "  --wallet-address  Address belonging to the wallet (repeatable)",
        "  --start-block, --end-block  Inclusive block height range",
        "  --start-date, --end-date  Normalized block time range in unix ms [start, end)",
    ]
    .join("\n")
}
