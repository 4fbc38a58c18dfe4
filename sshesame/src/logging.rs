//! Log sink setup. Called once, before anything else logs.

use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install the process-wide subscriber, writing to stdout. `RUST_LOG`
/// overrides the default `info` level. Records from russh, which uses
/// the `log` crate, are picked up too.
pub fn init(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    subscriber(format, env_filter, std::io::stdout).try_init()
}

/// The subscriber [init] installs, writing to `writer` instead.
pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> impl Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Clone + Send + Sync + 'static,
{
    let text = (format == LogFormat::Text)
        .then(|| fmt::layer().with_target(false).with_writer(writer.clone()));
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::indexing_slicing,
        clippy::panic
    )]

    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn emit(format: LogFormat) -> String {
        let captured = Captured::default();
        let subscriber = subscriber(format, EnvFilter::new("info"), captured.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(client = "192.0.2.1:4242", "Client connected");
            tracing::debug!("filtered out");
            tracing::warn!(error = "boom", "Handshake failed");
        });
        captured.text()
    }

    #[test]
    fn json_format_writes_one_object_per_line() {
        let text = emit(LogFormat::Json);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "{}", text);
        for line in &lines {
            assert!(line.starts_with('{') && line.ends_with('}'), "{}", line);
        }
        assert!(lines[0].contains(r#""message":"Client connected""#), "{}", lines[0]);
        assert!(lines[0].contains(r#""client":"192.0.2.1:4242""#), "{}", lines[0]);
        assert!(lines[1].contains(r#""level":"WARN""#), "{}", lines[1]);
    }

    #[test]
    fn text_format_is_not_json() {
        let text = emit(LogFormat::Text);
        assert_eq!(text.lines().count(), 2, "{}", text);
        assert!(!text.starts_with('{'));
        assert!(text.contains("Client connected"));
        assert!(!text.contains("filtered out"));
    }
}
