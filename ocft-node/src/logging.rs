//! Tracing setup. Logs go to stderr so stdout stays a clean text channel.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `verbosity`: 0=warn, 1=info, 2=debug, 3+=trace. RUST_LOG overrides.
pub fn init(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ocft_node={level},ocft_core={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 2),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))
}
