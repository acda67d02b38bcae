use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber shared by every binary.
///
/// `RUST_LOG` wins when set; `default_filter` covers the common case of a
/// scheduler invoking the binary with a bare environment.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
