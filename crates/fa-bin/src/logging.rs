//! Tracing subscriber setup for the binaries.

use tracing_subscriber::EnvFilter;

/// Initialise stderr logging. `RUST_LOG` overrides the default level;
/// `quiet` raises the default to warnings only.
pub fn init(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
