//! tracing-subscriber bootstrap: env-filter level from the config, fmt
//! output to stdout or a log file.

use std::io::Write;

use tracing_subscriber::EnvFilter;

use crate::{config::LogConfig, error::CoreError};

pub fn init(config: &LogConfig) -> Result<(), CoreError> {
    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CoreError::Config(format!("open log file {path}: {e}")))?;
            builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).try_init()
        }
        None => builder.try_init(),
    };

    // a second init (tests, embedding) keeps the first subscriber
    let _ = result;
    Ok(())
}

/// Best-effort flush of buffered output, used by the log-flushing task and
/// the crash hook.
pub fn flush() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
