//! Tracing subscriber setup for hosts embedding the engine.

use tracing_subscriber::EnvFilter;

/// Installs a stderr `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (e.g. `"info"` or
/// `"download_manager=debug"`) is used as the filter directive.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(default_level: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let _ = init_logging("warn");
        assert!(!init_logging("debug"));
    }
}
