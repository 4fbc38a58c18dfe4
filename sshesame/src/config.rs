use std::sync::Arc;
use std::time::Duration;

use russh::server;
use russh::{MethodKind, MethodSet, SshId};

use crate::auth::{AcceptAll, AuthObserver, AuthPolicy, LogObserver};
use crate::host_key::HostIdentity;

/// Time given to a connection's dispatch tasks to finish after the
/// client has gone.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a connection needs to know about the server. Built once,
/// then shared read-only by every connection.
pub struct ServerConfig {
    /// Sent to clients as-is. Should start with `SSH-2.0-` (RFC 4253
    /// section 4.2); this is not checked.
    pub server_version: String,
    pub host_identity: HostIdentity,
    pub auth_policy: Arc<dyn AuthPolicy>,
    pub auth_observer: Arc<dyn AuthObserver>,
    /// Bound on version exchange, key exchange and authentication.
    /// `None` lets a handshake take as long as the client likes.
    pub handshake_timeout: Option<Duration>,
    /// Drop established connections that stay silent this long.
    pub idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_version", &self.server_version)
            .field("host_identity", &self.host_identity.fingerprint())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    pub fn builder(server_version: impl Into<String>, host_identity: HostIdentity) -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: ServerConfig {
                server_version: server_version.into(),
                host_identity,
                auth_policy: Arc::new(AcceptAll),
                auth_observer: Arc::new(LogObserver),
                handshake_timeout: None,
                idle_timeout: None,
                shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            },
        }
    }

    /// Protocol configuration handed to russh for every connection.
    pub fn russh_config(&self) -> server::Config {
        server::Config {
            server_id: SshId::Standard(self.server_version.clone()),
            methods: MethodSet::from([MethodKind::Password].as_slice()),
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![self.host_identity.key().clone()],
            inactivity_timeout: self.idle_timeout,
            ..Default::default()
        }
    }
}

pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn auth_policy(mut self, policy: impl AuthPolicy + 'static) -> Self {
        self.config.auth_policy = Arc::new(policy);
        self
    }

    pub fn auth_observer(mut self, observer: impl AuthObserver + 'static) -> Self {
        self.config.auth_observer = Arc::new(observer);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
