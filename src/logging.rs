use tracing_subscriber::EnvFilter;

/// Initialize structured logging for a twinterpreter process.
///
/// Honors `RUST_LOG` when set and otherwise keeps the runtime quiet
/// below warnings. Output goes to stderr so stdout stays available for
/// machine-readable answers such as the codec probe. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("twinterp=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
