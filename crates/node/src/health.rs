//! Fixed-interval liveness probing of the remote node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::NodeConnection;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthSignal {
    Connected,
    Disconnected,
}

/// Edge detector over probe results.
#[derive(Debug, Default)]
pub struct HealthTracker {
    state: Option<bool>,
    ever_connected: bool,
}

/// What a single probe result means for the monitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Observation {
    pub signal: Option<HealthSignal>,
    pub first_connect: bool,
    pub reconnect: bool,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.state == Some(true)
    }

    pub fn observe(&mut self, ok: bool) -> Observation {
        let previous = self.state.replace(ok);
        let mut observation = Observation {
            signal: None,
            first_connect: false,
            reconnect: false,
        };
        if ok {
            if previous != Some(true) {
                observation.signal = Some(HealthSignal::Connected);
                observation.first_connect = !self.ever_connected;
                observation.reconnect = self.ever_connected;
                self.ever_connected = true;
            }
        } else if previous != Some(false) {
            observation.signal = Some(HealthSignal::Disconnected);
        }
        observation
    }
}

pub struct HealthMonitor {
    connection: Arc<NodeConnection>,
    endpoint: String,
    interval: Duration,
    signals: mpsc::UnboundedSender<HealthSignal>,
    halt: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        connection: Arc<NodeConnection>,
        endpoint: impl Into<String>,
        interval: Duration,
        signals: mpsc::UnboundedSender<HealthSignal>,
        halt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection,
            endpoint: endpoint.into(),
            interval,
            signals,
            halt,
        }
    }

    /// Runs until `halt` flips to true or its sender is dropped. The halt
    /// flag is checked before each tick.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tracker = HealthTracker::new();
            loop {
                if *self.halt.borrow() {
                    break;
                }
                let ok = self.probe().await;
                if !ok {
                    self.connection.reset();
                }
                let observation = tracker.observe(ok);
                self.report(&observation);
                if let Some(signal) = observation.signal {
                    if self.signals.send(signal).is_err() {
                        log_debug!("{}: health listener gone", self.connection.chain());
                        break;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    changed = self.halt.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            log_debug!("{}: health monitor stopped", self.connection.chain());
        })
    }

    async fn probe(&self) -> bool {
        let connection = Arc::clone(&self.connection);
        let result = tokio::task::spawn_blocking(move || {
            let client = connection.current()?;
            client.get_block_count()
        })
        .await;
        matches!(result, Ok(Ok(_)))
    }

    fn report(&self, observation: &Observation) {
        let chain = self.connection.chain();
        if observation.first_connect {
            log_info!(
                "Connected to peer: {} | Chain: {} | Network: {}",
                self.endpoint,
                chain.chain,
                chain.network
            );
        } else if observation.reconnect {
            log_warn!(
                "Reconnected to peer: {} | Chain: {} | Network: {}",
                self.endpoint,
                chain.chain,
                chain.network
            );
        } else if observation.signal == Some(HealthSignal::Disconnected) {
            log_warn!(
                "Not connected to peer: {} | Chain: {} | Network: {}",
                self.endpoint,
                chain.chain,
                chain.network
            );
        }
    }
}
