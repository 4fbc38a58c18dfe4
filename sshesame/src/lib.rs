#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! An SSH honeypot.
//!
//! The server accepts every password it is offered, logs the
//! credentials, and hands whatever the client does afterwards to a
//! [RequestHandler] (connection-level requests) and a [ChannelHandler]
//! (one call per opened channel).
//!
//! ```no_run
//! use sshesame::{HostIdentity, Listener, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshesame::Error> {
//!     let identity = HostIdentity::provision(None)?;
//!     let config = ServerConfig::builder("SSH-2.0-sshesame", identity).build();
//!     let listener = Listener::bind("localhost", 2022).await?;
//!     Server::new(config).run(listener).await;
//!     Ok(())
//! }
//! ```

pub mod auth;
mod config;
mod connection;
mod error;
pub mod handlers;
mod host_key;
mod listener;
pub mod logging;
mod server;
mod stream;

pub use auth::{AcceptAll, AuthAttempt, AuthDecision, AuthObserver, AuthPolicy, LogObserver};
pub use config::{ServerConfig, ServerConfigBuilder, DEFAULT_SHUTDOWN_GRACE};
pub use connection::{ConnectionState, ConnectionSupervisor, REQUEST_REPLY_WAIT};
pub use error::Error;
pub use handlers::{
    ChannelHandler, ChannelKind, GlobalRequest, GlobalRequestKind, GlobalRequestStream,
    LogChannels, LogRequests, OpenedChannel, RequestHandler, GLOBAL,
};
pub use host_key::{HostIdentity, Provenance};
pub use listener::Listener;
pub use server::Server;
pub use stream::{ClientIdStream, ClientVersion};
