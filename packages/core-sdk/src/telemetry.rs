use std::{fs::OpenOptions, path::Path};

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/**
 * \brief Install the global tracing subscriber.
 * \param level    fallback filter (e.g. "info") used when `RUST_LOG` is unset or invalid
 * \param log_file append log lines to this file instead of stderr
 */
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", level, e))?;

    let writer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!("failed to set subscriber: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_reports_error_instead_of_panicking() {
        let _ = init("info", None);
        let second = init("info", None);
        assert!(second.is_err());
    }
}
