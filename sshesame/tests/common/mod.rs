#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use russh::keys::PublicKey;
use russh::{client, ChannelMsg};
use sshesame::logging::{self, LogFormat};
use sshesame::{
    AuthAttempt, AuthDecision, AuthObserver, ChannelHandler, ChannelKind, GlobalRequestKind,
    GlobalRequestStream, HostIdentity, Listener, OpenedChannel, RequestHandler, Server,
    ServerConfig, ServerConfigBuilder,
};
use tokio::sync::mpsc;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Event {
    Attempt(AuthAttempt, AuthDecision),
    Request(GlobalRequestKind),
    RequestsClosed(&'static str),
    ChannelOpened(ChannelKind),
    ChannelClosed(ChannelKind),
}

/// Observer and handlers that report everything they see.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

pub struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(WAIT, self.0.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("recorder dropped")
    }

    /// Nothing arrives within `within`.
    pub async fn assert_quiet(&mut self, within: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(within, self.0.recv()).await {
            panic!("unexpected event {:?}", event);
        }
    }
}

pub fn recorder() -> (Recorder, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder { tx }, Events(rx))
}

impl AuthObserver for Recorder {
    fn observe(&self, attempt: &AuthAttempt, decision: AuthDecision) {
        let _ = self.tx.send(Event::Attempt(attempt.clone(), decision));
    }
}

#[async_trait]
impl RequestHandler for Recorder {
    async fn handle(
        &self,
        _client: SocketAddr,
        category: &'static str,
        mut requests: GlobalRequestStream,
    ) -> anyhow::Result<()> {
        while let Some(request) = requests.next().await {
            let _ = self.tx.send(Event::Request(request.kind().clone()));
            request.reject();
        }
        let _ = self.tx.send(Event::RequestsClosed(category));
        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for Recorder {
    async fn handle(&self, _client: SocketAddr, opened: OpenedChannel) -> anyhow::Result<()> {
        let OpenedChannel { kind, mut channel } = opened;
        let _ = self.tx.send(Event::ChannelOpened(kind.clone()));
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::Close = msg {
                break;
            }
        }
        let _ = self.tx.send(Event::ChannelClosed(kind));
        Ok(())
    }
}

pub fn config() -> ServerConfigBuilder {
    ServerConfig::builder("SSH-2.0-sshesame", HostIdentity::generate().unwrap())
        .shutdown_grace(Duration::from_secs(1))
}

/// Run a server on an ephemeral loopback port.
pub async fn start(
    config: ServerConfig,
    requests: impl RequestHandler,
    channels: impl ChannelHandler,
) -> SocketAddr {
    let listener = Listener::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr();
    let server = Server::with_handlers(config, requests, channels);
    tokio::spawn(async move { server.run(listener).await });
    addr
}

pub struct Client;

impl client::Handler for Client {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }
}

pub async fn connect(addr: SocketAddr) -> client::Handle<Client> {
    client::connect(Arc::new(client::Config::default()), addr, Client)
        .await
        .unwrap()
}

/// Connect and log in with a password the server will take.
pub async fn login(addr: SocketAddr, user: &str, password: &str) -> client::Handle<Client> {
    let mut session = connect(addr).await;
    let auth = session.authenticate_password(user, password).await.unwrap();
    assert!(auth.success(), "authentication refused");
    session
}

/// JSON log lines written while a [capture_logs] guard is alive.
#[derive(Clone, Default)]
pub struct Logs(Arc<Mutex<Vec<u8>>>);

impl io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Logs {
    type Writer = Logs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Logs {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Lines whose message is exactly `message`.
    pub fn with_message(&self, message: &str) -> Vec<String> {
        let needle = format!(r#""message":"{}""#, message);
        self.text()
            .lines()
            .filter(|line| line.contains(&needle))
            .map(str::to_string)
            .collect()
    }

    /// Wait until a line with `message` shows up and return it.
    pub async fn wait_for(&self, message: &str) -> String {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(line) = self.with_message(message).into_iter().next() {
                    return line;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        match found {
            Ok(line) => line,
            Err(_) => panic!("no {:?} record in:\n{}", message, self.text()),
        }
    }
}

/// Record this thread's logs as JSON. `#[tokio::test]` runs the server on
/// the test thread, so its records land here too.
pub fn capture_logs() -> (Logs, DefaultGuard) {
    let logs = Logs::default();
    let subscriber = logging::subscriber(LogFormat::Json, EnvFilter::new("info"), logs.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
