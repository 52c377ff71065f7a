use anyhow::{Context, Result};
use vlbimon_bridge::catalog::ParameterCatalog;
use vlbimon_bridge::config::Config;
use vlbimon_bridge::storage::initialize_schema;

fn main() -> Result<()> {
    let config = Config::from_env()?;
    vlbimon_bridge::init_tracing()?;

    let catalog = ParameterCatalog::from_path(&config.catalog_path)
        .context("failed to load parameter catalog")?;
    let column_types = catalog.column_types();
    tracing::info!(
        catalog = %config.catalog_path.display(),
        parameters = column_types.len(),
        stations = catalog.stations.len(),
        "creating database"
    );
    initialize_schema(&config.db_path, &column_types, &config.storage_options())
        .with_context(|| format!("failed to initialize {}", config.db_path.display()))?;
    Ok(())
}
