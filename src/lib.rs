pub mod bridge;
pub mod catalog;
pub mod client;
pub mod config;
pub mod cursor;
pub mod pipeline;
pub mod record;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod transform;

use anyhow::Result;

/// Installs the fmt subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,vlbimon_bridge=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
