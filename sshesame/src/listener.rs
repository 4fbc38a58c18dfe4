use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::info;

use crate::Error;

/// A bound TCP socket handing out raw inbound connections.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Resolve `host` and bind `port` on the first address that accepts it.
    pub async fn bind(host: &str, port: u16) -> Result<Self, Error> {
        let address = join_host_port(host, port);
        let candidates: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| Error::Resolve {
                address: address.clone(),
                source,
            })?
            .collect();
        if candidates.is_empty() {
            return Err(Error::Resolve {
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                address,
            });
        }

        let socket = TcpListener::bind(candidates.as_slice())
            .await
            .map_err(|source| Error::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| Error::Bind {
            address: address.clone(),
            source,
        })?;
        info!(listen_address = %local_addr, "Listening");
        Ok(Listener { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.socket.accept().await
    }
}

/// `host:port`, with brackets around IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::indexing_slicing,
        clippy::panic
    )]

    use super::*;

    #[test]
    fn joins_host_and_port() {
        assert_eq!(join_host_port("localhost", 2022), "localhost:2022");
        assert_eq!(join_host_port("::1", 22), "[::1]:22");
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1", 0).await.unwrap();
        assert!(listener.local_addr().ip().is_loopback());
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn address_in_use_is_a_bind_error() {
        let first = Listener::bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().port();
        match Listener::bind("127.0.0.1", port).await {
            Err(Error::Bind { address, .. }) => assert_eq!(address, format!("127.0.0.1:{}", port)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_resolve_error() {
        let err = Listener::bind("host.invalid", 2022).await.unwrap_err();
        assert!(matches!(err, Error::Resolve { .. }), "{:?}", err);
    }
}
