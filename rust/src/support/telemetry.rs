use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogLevel;
use crate::support::log_store::build_log_file_layer;

/// Installs the global subscriber: human-readable lines on stderr plus the
/// NDJSON file read back by `cmdstream logs tail`. `RUST_LOG` wins over
/// `--logLevel` when set.
pub fn init_telemetry(log_level: LogLevel, mode: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(log_level)));

    let file_layer = match build_log_file_layer(mode) {
        Ok(layer) => Some(layer),
        Err(err) => {
            eprintln!("[cmdstream] Log file disabled: {err}");
            None
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init();
}

fn default_directive(log_level: LogLevel) -> &'static str {
    match log_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::None => "off",
    }
}
