//! File-backed logging setup shared by application binaries.

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize logging to a file under the config directory. Returns the log
/// path so the caller can surface it to the user.
pub fn init(log_name: &str) -> anyhow::Result<PathBuf> {
    let dir = super::platform::config_dir();
    std::fs::create_dir_all(&dir)?;
    let log_path = dir.join(log_name);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sm_acquire=debug")),
        )
        .init();

    Ok(log_path)
}
