use anyhow::{bail, Context, Result};
use vlbimon_bridge::config::{Config, MigrateConfig, MigrateMode};
use vlbimon_bridge::storage::migrations::{self, Disposition, TableSet};
use vlbimon_bridge::storage::Storage;

fn describe(set: &TableSet) -> String {
    match set {
        TableSet::All(n) => format!("all {n} present"),
        TableSet::None => "none present".to_string(),
        TableSet::Partial { missing, .. } => format!("partial, missing {}", missing.join(", ")),
    }
}

fn main() -> Result<()> {
    let config = Config::from_env()?;
    let migrate = MigrateConfig::from_env()?;
    vlbimon_bridge::init_tracing()?;

    match migrate.mode {
        MigrateMode::Check => {
            let storage = Storage::open_read_only(&config.db_path)
                .with_context(|| format!("failed to open {}", config.db_path.display()))?;
            let steps = migrations::plan(storage.connection())
                .context("database is not in a state any migration can start from")?;
            for step in &steps {
                tracing::info!(
                    migration = %step.migration.label(),
                    disposition = ?step.disposition,
                    old_tables = %describe(&step.check.before),
                    new_tables = %describe(&step.check.after),
                    "migration status"
                );
            }
            let outstanding = steps
                .iter()
                .filter(|step| step.disposition != Disposition::Recorded)
                .count();
            storage.close()?;
            if outstanding > 0 {
                bail!("{outstanding} migration(s) outstanding; rerun with BRIDGE_MIGRATE_MODE=fix");
            }
            tracing::info!("database is up to date");
        }
        MigrateMode::Fix => {
            let mut storage = Storage::connect(&config.db_path, &config.storage_options())
                .with_context(|| format!("failed to open {}", config.db_path.display()))?;
            // refuse before taking a backup or touching anything
            migrations::plan(storage.connection())
                .context("refusing to migrate")?;
            if let Some(backup) = &migrate.backup {
                storage
                    .backup_to(backup)
                    .with_context(|| format!("failed to back up to {}", backup.display()))?;
            }
            let report = migrations::fix(storage.connection_mut()).context("migration failed")?;
            tracing::info!(
                applied = ?report.applied,
                recorded = ?report.recorded,
                "migrations complete"
            );
            storage.close()?;
        }
    }
    Ok(())
}
