use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sshesame::logging::{self, LogFormat};
use sshesame::{HostIdentity, Listener, Server, ServerConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// A file containing a private key to use. A temporary key is
    /// generated if none is given.
    #[arg(long = "host_key")]
    host_key: Option<PathBuf>,

    /// The local address to listen on.
    #[arg(long = "listen_address", default_value = "localhost")]
    listen_address: String,

    /// The port number to listen on.
    #[arg(long, default_value_t = 2022)]
    port: u16,

    /// Enable logging in JSON.
    #[arg(long = "json_logging")]
    json_logging: bool,

    /// The version identification of the server (RFC 4253 section 4.2
    /// requires that this string start with "SSH-2.0-").
    #[arg(long = "server_version", default_value = "SSH-2.0-sshesame")]
    server_version: String,

    /// Give up on clients that have not authenticated after this many seconds.
    #[arg(long = "handshake_timeout")]
    handshake_timeout: Option<u64>,

    /// Drop connections that stay silent for this many seconds.
    #[arg(long = "idle_timeout")]
    idle_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = if cli.json_logging {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    if let Err(e) = logging::init(format) {
        eprintln!("Failed to set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // An empty -host_key means "generate one", as does leaving it out.
    let host_key = cli.host_key.filter(|p| !p.as_os_str().is_empty());
    let identity = HostIdentity::provision(host_key.as_deref())?;

    let config = ServerConfig::builder(cli.server_version, identity)
        .handshake_timeout(cli.handshake_timeout.map(Duration::from_secs))
        .idle_timeout(cli.idle_timeout.map(Duration::from_secs))
        .build();

    let listener = Listener::bind(&cli.listen_address, cli.port).await?;
    let server = Server::new(config);
    server
        .run_until(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
            } else {
                futures::future::pending::<()>().await
            }
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshesame::Error;

    #[test]
    fn flags_keep_their_names_and_defaults() {
        let cli = Cli::parse_from(["sshesame"]);
        assert_eq!(cli.host_key, None);
        assert_eq!(cli.listen_address, "localhost");
        assert_eq!(cli.port, 2022);
        assert!(!cli.json_logging);
        assert_eq!(cli.server_version, "SSH-2.0-sshesame");
        assert_eq!(cli.handshake_timeout, None);

        let cli = Cli::parse_from([
            "sshesame",
            "--host_key",
            "/etc/ssh/ssh_host_ed25519_key",
            "--listen_address",
            "0.0.0.0",
            "--port",
            "22",
            "--json_logging",
            "--server_version",
            "SSH-2.0-OpenSSH_8.9p1",
            "--idle_timeout",
            "600",
        ]);
        assert_eq!(cli.host_key, Some(PathBuf::from("/etc/ssh/ssh_host_ed25519_key")));
        assert_eq!(cli.listen_address, "0.0.0.0");
        assert_eq!(cli.port, 22);
        assert!(cli.json_logging);
        assert_eq!(cli.server_version, "SSH-2.0-OpenSSH_8.9p1");
        assert_eq!(cli.idle_timeout, Some(600));
    }

    #[tokio::test]
    async fn unreadable_host_key_stops_before_listening() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "sshesame",
            "--host_key",
            dir.path().join("missing").to_str().unwrap(),
            "--listen_address",
            "127.0.0.1",
            "--port",
            "0",
        ]);

        // Reaching the listener would mean serving until interrupted.
        let result = tokio::time::timeout(Duration::from_secs(5), run(cli))
            .await
            .expect("run kept going after a bad host key");
        let err = result.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<Error>(), Some(Error::KeyRead { .. })),
            "{:?}",
            err
        );
    }
}
