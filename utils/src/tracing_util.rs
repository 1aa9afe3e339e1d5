//! Tracing setup for the agent entrypoint.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with `default_level` as the fallback verbosity;
/// directives in `RUST_LOG` take precedence over it. The agent runs
/// under service managers that stamp log lines themselves, so the
/// format carries no timestamps.
pub fn initialize_tracing(default_level: tracing::Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .without_time()
        .with_target(false)
        .init();
}
