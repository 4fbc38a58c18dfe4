//! What happens to a connection once it is established.
//!
//! The supervisor does not interpret global requests or channels. It
//! hands them to a [RequestHandler] and a [ChannelHandler]. The
//! implementations here only log what they see.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::StreamExt;
use russh::server::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Category label of the connection-level request stream.
pub const GLOBAL: &str = "global";

/// Connection-level requests, in arrival order.
pub type GlobalRequestStream = ReceiverStream<GlobalRequest>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestKind {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
}

impl GlobalRequestKind {
    /// The request name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            GlobalRequestKind::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestKind::CancelTcpipForward { .. } => "cancel-tcpip-forward",
        }
    }
}

/// A global request waiting for an answer.
///
/// Dropping it without replying answers the client with a failure, and
/// so does replying later than [crate::REQUEST_REPLY_WAIT].
#[derive(Debug)]
pub struct GlobalRequest {
    kind: GlobalRequestKind,
    reply: oneshot::Sender<bool>,
}

impl GlobalRequest {
    pub fn new(kind: GlobalRequestKind) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (GlobalRequest { kind, reply }, rx)
    }

    pub fn kind(&self) -> &GlobalRequestKind {
        &self.kind
    }

    pub fn reply(self, accepted: bool) {
        let _ = self.reply.send(accepted);
    }

    pub fn accept(self) {
        self.reply(true)
    }

    pub fn reject(self) {
        self.reply(false)
    }
}

/// The type of a newly opened channel and its open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
    X11 {
        originator_address: String,
        originator_port: u32,
    },
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::X11 { .. } => "x11",
        }
    }
}

/// A channel the client opened. It has already been accepted.
#[derive(Debug)]
pub struct OpenedChannel {
    pub kind: ChannelKind,
    pub channel: Channel<Msg>,
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Consume the requests of one connection until the stream ends.
    async fn handle(
        &self,
        client: SocketAddr,
        category: &'static str,
        requests: GlobalRequestStream,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Serve one channel. Runs in its own task.
    async fn handle(&self, client: SocketAddr, channel: OpenedChannel) -> anyhow::Result<()>;
}

/// Logs every global request and declines it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRequests;

#[async_trait]
impl RequestHandler for LogRequests {
    async fn handle(
        &self,
        client: SocketAddr,
        category: &'static str,
        mut requests: GlobalRequestStream,
    ) -> anyhow::Result<()> {
        while let Some(request) = requests.next().await {
            match request.kind() {
                GlobalRequestKind::TcpipForward { address, port }
                | GlobalRequestKind::CancelTcpipForward { address, port } => info!(
                    client = %client,
                    category,
                    request_type = request.kind().name(),
                    address = %address,
                    port,
                    "Global request"
                ),
            }
            request.reject();
        }
        Ok(())
    }
}

/// Logs channel opens, channel requests and data, until the channel closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannels;

#[async_trait]
impl ChannelHandler for LogChannels {
    async fn handle(&self, client: SocketAddr, opened: OpenedChannel) -> anyhow::Result<()> {
        let OpenedChannel { kind, mut channel } = opened;
        let id = channel.id();
        match &kind {
            ChannelKind::Session => info!(client = %client, channel = %id, "New session channel"),
            ChannelKind::DirectTcpip {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            } => info!(
                client = %client,
                channel = %id,
                host_to_connect = %host_to_connect,
                port_to_connect,
                originator_address = %originator_address,
                originator_port,
                "New direct-tcpip channel"
            ),
            ChannelKind::X11 {
                originator_address,
                originator_port,
            } => info!(
                client = %client,
                channel = %id,
                originator_address = %originator_address,
                originator_port,
                "New x11 channel"
            ),
        }

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => info!(
                    client = %client,
                    channel = %id,
                    data = %String::from_utf8_lossy(&data),
                    "Channel input"
                ),
                ChannelMsg::ExtendedData { data, ext } => info!(
                    client = %client,
                    channel = %id,
                    ext,
                    data = %String::from_utf8_lossy(&data),
                    "Channel extended input"
                ),
                ChannelMsg::RequestPty {
                    term,
                    col_width,
                    row_height,
                    ..
                } => info!(
                    client = %client,
                    channel = %id,
                    term = %term,
                    width = col_width,
                    height = row_height,
                    "PTY requested"
                ),
                ChannelMsg::SetEnv {
                    variable_name,
                    variable_value,
                    ..
                } => info!(
                    client = %client,
                    channel = %id,
                    name = %variable_name,
                    value = %variable_value,
                    "Environment variable set"
                ),
                ChannelMsg::RequestShell { .. } => {
                    info!(client = %client, channel = %id, "Shell requested")
                }
                ChannelMsg::Exec { command, .. } => info!(
                    client = %client,
                    channel = %id,
                    command = %String::from_utf8_lossy(&command),
                    "Command execution requested"
                ),
                ChannelMsg::RequestSubsystem { name, .. } => info!(
                    client = %client,
                    channel = %id,
                    subsystem = %name,
                    "Subsystem requested"
                ),
                ChannelMsg::Eof => {
                    debug!(client = %client, channel = %id, "Channel EOF");
                    channel.close().await?;
                }
                ChannelMsg::Close => break,
                other => debug!(client = %client, channel = %id, msg = ?other, "Channel message"),
            }
        }

        info!(client = %client, channel = %id, channel_type = kind.name(), "Channel closed");
        Ok(())
    }
}
