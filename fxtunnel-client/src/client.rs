// Client orchestration: connection lifecycle and auto-reconnection

use crate::connection;
use crate::{ClientError, ClientResult};
use fxtunnel_config::{ClientConfig, ReconnectionConfig};
use fxtunnel_mux::MuxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connection state, observable through `TunnelClient::watch_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

/// Retry delay policy
#[derive(Debug, Clone)]
pub enum ReconnectionStrategy {
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
    },
    Fixed {
        delay: Duration,
    },
}

impl ReconnectionStrategy {
    /// Delay before the given attempt (1-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self {
            ReconnectionStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
                jitter_factor,
            } => {
                let cap = max_delay.as_secs_f64();
                let mut delay = initial_delay.as_secs_f64();
                for _ in 1..attempt {
                    if delay >= cap {
                        break;
                    }
                    delay *= multiplier;
                }
                let delay = delay.min(cap);
                // Full jitter over the configured fraction: shave up to
                // `jitter_factor` of the delay so reconnecting clients
                // fan out instead of thundering back together
                let shave = delay * jitter_factor.clamp(0.0, 1.0) * rand::random::<f64>();
                Duration::from_secs_f64(delay - shave)
            }
            ReconnectionStrategy::Fixed { delay } => *delay,
        }
    }
}

impl From<&ReconnectionConfig> for ReconnectionStrategy {
    fn from(config: &ReconnectionConfig) -> Self {
        ReconnectionStrategy::Exponential {
            initial_delay: Duration::from_secs(config.initial_delay),
            max_delay: Duration::from_secs(config.max_delay),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// The tunnel client: connects, authenticates, opens the configured
/// tunnels, and keeps reconnecting until shut down
pub struct TunnelClient {
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> ClientResult<TunnelClient> {
        if config.server_host.is_empty() {
            return Err(ClientError::ConfigError("server_host must be set".to_string()));
        }
        if config.token.is_empty() {
            return Err(ClientError::ConfigError("token must be set".to_string()));
        }
        if config.tunnels.is_empty() {
            return Err(ClientError::ConfigError("no tunnels configured".to_string()));
        }
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Ok(TunnelClient { config, state_tx, state_rx })
    }

    /// Observe connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            window: self.config.mux.window_bytes,
            keepalive_interval: Duration::from_secs(self.config.mux.keepalive_secs),
            max_streams: self.config.mux.max_streams,
            ..MuxConfig::default()
        }
    }

    /// Run until `shutdown` fires or retries are exhausted
    pub async fn run(&self, shutdown: CancellationToken) -> ClientResult<()> {
        let strategy = ReconnectionStrategy::from(&self.config.reconnection);
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                return Ok(());
            }

            let _ = self.state_tx.send(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match connection::connect_once(
                &self.config,
                self.mux_config(),
                &self.state_tx,
                &shutdown,
            )
            .await
            {
                Ok(()) => {
                    // Clean disconnect; retry from a fresh backoff unless
                    // we're shutting down
                    attempt = 0;
                    if shutdown.is_cancelled() {
                        let _ = self.state_tx.send(ConnectionState::Disconnected);
                        return Ok(());
                    }
                    info!("disconnected from server");
                }
                Err(ClientError::AuthenticationFailed(msg)) => {
                    // A rejected token will not fix itself
                    let _ = self.state_tx.send(ConnectionState::Failed(msg.clone()));
                    return Err(ClientError::AuthenticationFailed(msg));
                }
                Err(e) => {
                    warn!("connection attempt failed: {}", e);
                }
            }

            if !self.config.reconnection.enabled {
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                return Ok(());
            }
            attempt += 1;
            if self.config.reconnection.max_attempts > 0
                && attempt > self.config.reconnection.max_attempts
            {
                let msg = format!("gave up after {} attempts", attempt - 1);
                let _ = self.state_tx.send(ConnectionState::Failed(msg.clone()));
                return Err(ClientError::ConnectionFailed(msg));
            }

            let delay = strategy.next_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
