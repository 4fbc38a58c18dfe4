//! # Per-connection supervision
//!
//! Each accepted socket goes through
//! `Accepted -> Handshaking -> Established -> Dispatching -> Closed`.
//!
//! The handshake is run by russh. Our [SessionHandler] sits inside the
//! russh session and turns its callbacks into two streams: global
//! requests and opened channels. Once the client has authenticated, the
//! [ConnectionSupervisor] starts one task draining each stream. Every
//! channel then gets a task of its own, so a stuck channel never holds
//! up the next one.
//!
//! All tasks of a connection live in [JoinSet]s owned by the
//! supervisor. When the socket closes, russh drops the handler, both
//! streams end, and whatever is still running after the grace period
//! is aborted.
//!
//! The supervisor holds a [CancellationToken] for its socket. Cancelling
//! it makes the socket read as closed, which ends the russh session task.
//! It is cancelled on handshake failure, on server shutdown and whenever
//! the supervisor itself goes away.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthAttempt, AuthDecision};
use crate::config::ServerConfig;
use crate::handlers::{
    ChannelHandler, ChannelKind, GlobalRequest, GlobalRequestKind, GlobalRequestStream,
    OpenedChannel, RequestHandler, GLOBAL,
};
use crate::stream::{ClientIdStream, ClientVersion};
use crate::Error;

/// Events buffered per stream before the russh session waits for the
/// dispatch task.
const EVENT_BUFFER: usize = 16;

/// How long the russh session waits for the [RequestHandler] to answer a
/// global request. Later answers are lost and the client sees a refusal.
pub const REQUEST_REPLY_WAIT: Duration = Duration::from_millis(100);

/// Newly opened channels, in arrival order.
type ChannelStream = ReceiverStream<OpenedChannel>;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Established,
    Dispatching,
    Closed,
}

/// The russh side of a connection: answers authentication and feeds
/// the two event streams.
pub(crate) struct SessionHandler {
    client: SocketAddr,
    version: ClientVersion,
    config: Arc<ServerConfig>,
    established: Option<oneshot::Sender<()>>,
    requests: mpsc::Sender<GlobalRequest>,
    channels: mpsc::Sender<OpenedChannel>,
}

impl SessionHandler {
    /// Hand a global request to the dispatch task. The russh session is
    /// blocked while this runs, so the wait for an answer is bounded.
    async fn forward_request(&mut self, kind: GlobalRequestKind) -> bool {
        let name = kind.name();
        let (request, reply) = GlobalRequest::new(kind);
        let answered = tokio::time::timeout(REQUEST_REPLY_WAIT, async {
            self.requests.send(request).await.ok()?;
            reply.await.ok()
        })
        .await;
        match answered {
            Ok(accepted) => accepted.unwrap_or(false),
            Err(_) => {
                debug!(client = %self.client, request = name, "Global request not answered in time");
                false
            }
        }
    }

    async fn forward_channel(&mut self, kind: ChannelKind, channel: Channel<Msg>) -> bool {
        debug!(client = %self.client, channel = %channel.id(), channel_type = kind.name(), "Channel opened");
        self.channels
            .send(OpenedChannel { kind, channel })
            .await
            .is_ok()
    }

    fn acknowledge(
        &self,
        channel: ChannelId,
        request: &'static str,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        debug!(client = %self.client, channel = %channel, request, "Channel request");
        session.channel_success(channel)
    }
}

impl server::Handler for SessionHandler {
    type Error = russh::Error;

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let attempt = AuthAttempt {
            client: self.client,
            user: user.to_string(),
            password: password.to_string(),
            version: self.version.to_string_lossy(),
        };
        let decision = self.config.auth_policy.decide(&attempt);
        self.config.auth_observer.observe(&attempt, decision);
        async move {
            Ok(match decision {
                AuthDecision::Accept => Auth::Accept,
                AuthDecision::Reject => Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                },
            })
        }
    }

    fn auth_succeeded(
        &mut self,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(established) = self.established.take() {
            let _ = established.send(());
        }
        async { Ok(()) }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async move { Ok(self.forward_channel(ChannelKind::Session, channel).await) }
    }

    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let kind = ChannelKind::DirectTcpip {
            host_to_connect: host_to_connect.to_string(),
            port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        async move { Ok(self.forward_channel(kind, channel).await) }
    }

    fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let kind = ChannelKind::X11 {
            originator_address: originator_address.to_string(),
            originator_port,
        };
        async move { Ok(self.forward_channel(kind, channel).await) }
    }

    fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let kind = GlobalRequestKind::TcpipForward {
            address: address.to_string(),
            port: *port,
        };
        async move { Ok(self.forward_request(kind).await) }
    }

    fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let kind = GlobalRequestKind::CancelTcpipForward {
            address: address.to_string(),
            port,
        };
        async move { Ok(self.forward_request(kind).await) }
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.acknowledge(channel, "pty-req", session);
        async move { result }
    }

    fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.acknowledge(channel, "env", session);
        async move { result }
    }

    fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.acknowledge(channel, "shell", session);
        async move { result }
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.acknowledge(channel, "exec", session);
        async move { result }
    }

    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.acknowledge(channel, "subsystem", session);
        async move { result }
    }
}

/// Owns one client connection from accept to close.
pub struct ConnectionSupervisor {
    client: SocketAddr,
    config: Arc<ServerConfig>,
    russh_config: Arc<server::Config>,
    requests: Arc<dyn RequestHandler>,
    channels: Arc<dyn ChannelHandler>,
    close: CancellationToken,
    state: ConnectionState,
}

impl ConnectionSupervisor {
    /// `close` ends the connection when cancelled. The supervisor also
    /// cancels it on every way out of [ConnectionSupervisor::run].
    pub fn new(
        client: SocketAddr,
        config: Arc<ServerConfig>,
        russh_config: Arc<server::Config>,
        requests: Arc<dyn RequestHandler>,
        channels: Arc<dyn ChannelHandler>,
        close: CancellationToken,
    ) -> Self {
        ConnectionSupervisor {
            client,
            config,
            russh_config,
            requests,
            channels,
            close,
            state: ConnectionState::Accepted,
        }
    }

    fn enter(&mut self, state: ConnectionState) {
        debug!(client = %self.client, from = ?self.state, to = ?state, "Connection state");
        self.state = state;
    }

    /// Drive the connection until the client goes away. Never fails:
    /// every error is logged and stays with this connection.
    pub async fn run<S>(mut self, socket: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        // Closes the socket even if this task is aborted.
        let _close = self.close.clone().drop_guard();
        self.enter(ConnectionState::Handshaking);
        let (stream, version) = ClientIdStream::new(socket, self.close.clone());
        let (established_tx, mut established_rx) = oneshot::channel();
        let (requests_tx, requests_rx) = mpsc::channel(EVENT_BUFFER);
        let (channels_tx, channels_rx) = mpsc::channel(EVENT_BUFFER);
        let handler = SessionHandler {
            client: self.client,
            version: version.clone(),
            config: self.config.clone(),
            established: Some(established_tx),
            requests: requests_tx,
            channels: channels_tx,
        };

        let russh_config = self.russh_config.clone();
        let handshake = async {
            let mut session = match server::run_stream(russh_config, stream, handler).await {
                Ok(session) => Box::pin(session),
                Err(e) => return Err(Error::Handshake(e)),
            };
            tokio::select! {
                biased;
                Ok(()) = &mut established_rx => Ok::<_, Error>(session),
                result = &mut session => Err(match result {
                    Ok(()) => Error::HandshakeIncomplete,
                    Err(e) => Error::Handshake(e),
                }),
            }
        };
        let handshake = match self.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or(Err(Error::HandshakeTimeout)),
            None => handshake.await,
        };
        let session = match handshake {
            Ok(session) => session,
            Err(e) => {
                warn!(client = %self.client, error = %e, "Handshake failed");
                self.close.cancel();
                self.enter(ConnectionState::Closed);
                return;
            }
        };

        self.enter(ConnectionState::Established);
        info!(
            client = %self.client,
            version = %version.to_string_lossy(),
            "SSH connection established"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch_requests(
            self.client,
            self.requests.clone(),
            ReceiverStream::new(requests_rx),
        ));
        tasks.spawn(dispatch_channels(
            self.client,
            self.channels.clone(),
            ReceiverStream::new(channels_rx),
            self.config.shutdown_grace,
        ));
        self.enter(ConnectionState::Dispatching);

        if let Err(e) = session.await {
            debug!(client = %self.client, error = %e, "SSH session ended with an error");
        }

        wind_down(self.client, &mut tasks, self.config.shutdown_grace).await;
        self.enter(ConnectionState::Closed);
        info!(client = %self.client, "Client disconnected");
    }
}

async fn dispatch_requests(
    client: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    requests: GlobalRequestStream,
) {
    if let Err(e) = handler.handle(client, GLOBAL, requests).await {
        warn!(client = %client, error = %e, "Global request handler failed");
    }
}

async fn dispatch_channels(
    client: SocketAddr,
    handler: Arc<dyn ChannelHandler>,
    mut channels: ChannelStream,
    grace: Duration,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            opened = channels.next() => match opened {
                Some(opened) => {
                    let handler = handler.clone();
                    let id = opened.channel.id();
                    tasks.spawn(async move {
                        if let Err(e) = handler.handle(client, opened).await {
                            warn!(client = %client, channel = %id, error = %e, "Channel handler failed");
                        }
                    });
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => report(client, joined),
        }
    }
    wind_down(client, &mut tasks, grace).await;
}

/// Join everything left in `tasks`, aborting what outlives `grace`.
async fn wind_down(client: SocketAddr, tasks: &mut JoinSet<()>, grace: Duration) {
    let joined = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            report(client, joined);
        }
    })
    .await;
    if joined.is_err() {
        debug!(client = %client, remaining = tasks.len(), "Aborting connection tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

fn report(client: SocketAddr, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(client = %client, error = %e, "Connection task panicked");
        }
    }
}
