use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh::server;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionSupervisor;
use crate::handlers::{ChannelHandler, LogChannels, LogRequests, RequestHandler};
use crate::listener::Listener;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The accept loop: one [ConnectionSupervisor] task per client.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    russh_config: Arc<server::Config>,
    requests: Arc<dyn RequestHandler>,
    channels: Arc<dyn ChannelHandler>,
}

impl Server {
    /// A server whose handlers only log.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handlers(config, LogRequests, LogChannels)
    }

    pub fn with_handlers(
        config: ServerConfig,
        requests: impl RequestHandler,
        channels: impl ChannelHandler,
    ) -> Self {
        let russh_config = Arc::new(config.russh_config());
        Server {
            config: Arc::new(config),
            russh_config,
            requests: Arc::new(requests),
            channels: Arc::new(channels),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept clients forever.
    pub async fn run(&self, listener: Listener) {
        self.run_until(listener, futures::future::pending()).await
    }

    /// Accept clients until `shutdown` resolves, then close every live
    /// connection. Connections get `shutdown_grace` to wind down before
    /// their tasks are aborted.
    pub async fn run_until(&self, listener: Listener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let closing = CancellationToken::new();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, client)) => {
                        info!(client = %client, "Client connected");
                        let supervisor = ConnectionSupervisor::new(
                            client,
                            self.config.clone(),
                            self.russh_config.clone(),
                            self.requests.clone(),
                            self.channels.clone(),
                            closing.child_token(),
                        );
                        connections.spawn(supervisor.run(socket));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            warn!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }
        debug!(live = connections.len(), "Shutting down");
        closing.cancel();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            connections.shutdown().await;
        }
        info!(listen_address = %listener.local_addr(), "Stopped listening");
    }
}
