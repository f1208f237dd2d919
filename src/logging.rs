use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
///
/// Events go to stderr; stdout carries command output only.
pub fn init(level: &str, format: LogFormat) -> Result<()> {
    subscriber(level, format, std::io::stderr)
        .try_init()
        .context("initializing logging")
}

fn subscriber<W>(level: &str, format: LogFormat, writer: W) -> impl Subscriber + Send + Sync + use<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
    };
    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}

/// `debug` when asked for, `info` otherwise; other crates stay at `warn`.
pub fn level(debug: bool) -> &'static str {
    if debug {
        "warn,barista=debug"
    } else {
        "warn,barista=info"
    }
}
