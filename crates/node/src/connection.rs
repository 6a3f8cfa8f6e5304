//! Per chain+network handle to the remote node.

use std::sync::{Arc, Mutex};

use chainsync_primitives::ChainId;

use crate::rpc::{JsonRpcClient, NodeRpc, RpcClientConfig, RpcError};

pub type ClientFactory = dyn Fn() -> Result<Arc<dyn NodeRpc>, RpcError> + Send + Sync;

/// Caches one client per chain+network. Fetches for a chain are serialized
/// by the sync engine, so the cached handle is never driven concurrently by
/// two block fetches.
pub struct NodeConnection {
    chain: ChainId,
    factory: Arc<ClientFactory>,
    cached: Mutex<Option<Arc<dyn NodeRpc>>>,
}

impl NodeConnection {
    pub fn new(chain: ChainId, factory: Arc<ClientFactory>) -> Self {
        Self {
            chain,
            factory,
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(chain: ChainId, config: RpcClientConfig) -> Self {
        let factory: Arc<ClientFactory> = Arc::new(move || {
            let client: Arc<dyn NodeRpc> = Arc::new(JsonRpcClient::new(config.clone()));
            Ok(client)
        });
        Self::new(chain, factory)
    }

    /// Wraps an existing client; `reset` hands the same client back out.
    pub fn with_client(chain: ChainId, client: Arc<dyn NodeRpc>) -> Self {
        let factory: Arc<ClientFactory> = Arc::new(move || Ok(Arc::clone(&client)));
        Self::new(chain, factory)
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    /// Cached client, created on first use.
    pub fn current(&self) -> Result<Arc<dyn NodeRpc>, RpcError> {
        let mut cached = self.lock_cached()?;
        if let Some(client) = cached.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = (self.factory)()?;
        *cached = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drops the cached client; the next call creates a fresh one.
    pub fn reset(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached
            .lock()
            .map(|cached| cached.is_some())
            .unwrap_or(false)
    }

    /// Runs `call` against the cached client on the blocking pool.
    pub async fn call<T, F>(self: &Arc<Self>, call: F) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn NodeRpc) -> Result<T, RpcError> + Send + 'static,
    {
        let connection = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let client = connection.current()?;
            call(client.as_ref())
        })
        .await
        .map_err(|err| RpcError::Transport(format!("rpc task failed: {err}")))?
    }

    fn lock_cached(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<Arc<dyn NodeRpc>>>, RpcError> {
        self.cached
            .lock()
            .map_err(|_| RpcError::Transport("rpc client lock poisoned".to_string()))
    }
}
