use tracing_subscriber::EnvFilter;

/// Logs go to stderr so they never interleave with REPL output on stdout.
/// Filter comes from RUNA_LOG, falling back to RUST_LOG, then "warn".
pub fn init() {
    let filter = EnvFilter::try_from_env("RUNA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
