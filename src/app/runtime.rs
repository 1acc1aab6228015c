//! Runtime - process lifecycle
//!
//! Binds the local listener, bootstraps the node list, then runs the accept
//! loop, the periodic subscription refresh and the optional control API
//! until Ctrl+C or `shutdown()`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::common::{Address, Result};
use crate::config::Config;
use crate::error::Error;
use crate::transport::{Listener, TcpTransport, Transport};

use super::api::start_api_server;
use super::controller::Controller;
use super::dispatcher::Dispatcher;
use super::metrics::init_metrics;

/// Runtime manages the proxy lifecycle
pub struct Runtime {
    config: Config,
    controller: Arc<Controller>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build runtime from configuration; no network IO happens here
    pub fn from_config(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let controller = Arc::new(Controller::from_config(&config)?);
        let dispatcher = Arc::new(Dispatcher::new(
            controller.registry().clone(),
            controller.stats().clone(),
            config.timeouts.clone(),
        ));

        Ok(Self {
            config,
            controller,
            dispatcher,
            shutdown_tx,
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Ask a running `run()` to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run until Ctrl+C or `shutdown()`. Failing to bind the listener is fatal.
    pub async fn run(&self) -> Result<()> {
        init_metrics();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listen = Address::parse(&format!("{}:{}", self.config.listen_address, self.config.local_port))
            .map_err(|e| Error::Config(format!("Invalid listen address: {}", e)))?;
        let listener = TcpTransport::new().bind(&listen).await.map_err(|e| {
            error!("[runtime] Cannot bind {}: {}", listen, e);
            e
        })?;
        info!("[runtime] Listening on {}", listener.local_addr()?);

        self.controller.bootstrap().await;

        let mut handles = Vec::new();
        handles.push(self.spawn_inbound(listener));
        if let Some(handle) = self.spawn_refresh() {
            handles.push(handle);
        }
        if let Some(handle) = self.spawn_api() {
            handles.push(handle);
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("[runtime] Shutting down...");
            }
            _ = shutdown_rx.recv() => {
                info!("[runtime] Shutdown requested");
            }
        }

        // Tasks subscribed before the signal; this wakes all of them
        let _ = self.shutdown_tx.send(());
        for handle in handles {
            let _ = handle.await;
        }

        let stats = self.controller.stats_snapshot();
        info!(
            "[runtime] Stopped after {} connections, {} bytes relayed",
            stats.total_connections, stats.total_bytes
        );
        Ok(())
    }

    fn spawn_inbound(&self, listener: Box<dyn Listener>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut conn_count: u64 = 0;
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, source)) => {
                                conn_count += 1;
                                let conn_id = conn_count;
                                debug!("[runtime] New connection #{} from {}", conn_id, source);

                                let dispatcher = dispatcher.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = dispatcher.dispatch(stream, source.clone()).await {
                                        warn!("[runtime] Connection #{} from {} error: {}", conn_id, source, e);
                                    }
                                });
                            }
                            Err(e) => error!("[runtime] Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("[runtime] Listener closed (handled {} connections)", conn_count);
                        break;
                    }
                }
            }
        })
    }

    /// Periodic refresh; the first tick is one full period after startup
    fn spawn_refresh(&self) -> Option<JoinHandle<()>> {
        if !self.controller.has_subscription() {
            return None;
        }
        let period = self.config.update_interval();
        let controller = self.controller.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("[runtime] Subscription refresh every {:?}", period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = controller.update_subscription().await {
                            warn!("[runtime] Scheduled refresh failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }))
    }

    fn spawn_api(&self) -> Option<JoinHandle<()>> {
        let listen = self.config.api_listen.as_deref()?;
        let addr: SocketAddr = match listen.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("[runtime] Invalid API listen address {}: {}", listen, e);
                return None;
            }
        };
        let controller = self.controller.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(start_api_server(addr, controller, shutdown_rx)))
    }
}
