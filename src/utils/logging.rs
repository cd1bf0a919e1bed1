use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` selects the filter, `info` otherwise.
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let fmt = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).with_ansi(false);
    let _ = fmt.try_init();
}
