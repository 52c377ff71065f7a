//! The live loop: one snapshot per tick, committed before the cursor moves.

use crate::catalog::ParameterCatalog;
use crate::client::auth::Credentials;
use crate::client::{ApiClient, Endpoint, FetchOutcome, RetryPolicy};
use crate::config::Config;
use crate::cursor::{Cursor, CursorFile};
use crate::pipeline::{Pipeline, PipelineOptions, TickStats};
use crate::storage::migrations::{self, Disposition};
use crate::storage::Storage;
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub heartbeat: Duration,
    pub stop_file: PathBuf,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.poll_interval(),
            heartbeat: config.heartbeat_interval(),
            stop_file: config.stop_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: FetchOutcome,
    pub committed: bool,
    pub stats: TickStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StopFile,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub reason: StopReason,
}

/// Time left in the current tick; zero once the tick has overrun.
pub fn remaining_in_tick(started: Instant, interval: Duration, now: Instant) -> Duration {
    (started + interval).saturating_duration_since(now)
}

/// Everything one running bridge owns between ticks.
pub struct Bridge {
    client: ApiClient,
    pipeline: Pipeline,
    storage: Storage,
    cursor_file: CursorFile,
    cursor: Cursor,
    settings: LoopSettings,
}

impl Bridge {
    pub fn new(
        client: ApiClient,
        pipeline: Pipeline,
        storage: Storage,
        cursor_file: CursorFile,
        cursor: Cursor,
        settings: LoopSettings,
    ) -> Self {
        Self {
            client,
            pipeline,
            storage,
            cursor_file,
            cursor,
            settings,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Fetch, process and commit one snapshot.
    ///
    /// The cursor file is rewritten only after a successful commit. A failed
    /// commit keeps the previous snapshot cursor but adopts a renewed session.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let started = Instant::now();
        let fetched = self
            .client
            .fetch_snapshot(&self.cursor.sessionid, self.cursor.last_snap)
            .await?;

        let batch = self.pipeline.process(&fetched.snapshot, unix_now());
        let committed = match self.pipeline.commit(&mut self.storage, &batch) {
            Ok(summary) => {
                let next = Cursor {
                    sessionid: fetched.session,
                    last_snap: fetched.cursor,
                };
                if next != self.cursor {
                    if let Err(err) = self.cursor_file.save(&next) {
                        tracing::warn!(error = %err, "failed to persist cursor");
                    }
                    self.cursor = next;
                }
                tracing::debug!(
                    outcome = ?fetched.outcome,
                    stations = batch.stats.stations,
                    records = batch.stats.records,
                    events = batch.stats.events,
                    status_rows = batch.stats.status_rows,
                    skipped_tables = summary.skipped_tables,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tick"
                );
                true
            }
            Err(err) => {
                // the same data is fetched again next tick
                tracing::error!(error = %err, records = batch.stats.records, "commit failed, keeping previous cursor");
                self.cursor.sessionid = fetched.session;
                false
            }
        };

        Ok(TickReport {
            outcome: fetched.outcome,
            committed,
            stats: batch.stats,
        })
    }

    /// Ticks on a fixed cadence until the stop file appears or `shutdown`
    /// resolves, then closes the database.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticks = 0u64;
        let mut last_heartbeat = Instant::now();

        let reason = loop {
            let started = Instant::now();

            tokio::select! {
                report = self.tick() => {
                    report?;
                    ticks += 1;
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break StopReason::Signal;
                }
            }

            if last_heartbeat.elapsed() >= self.settings.heartbeat {
                self.log_heartbeat();
                last_heartbeat = Instant::now();
            }

            if self.settings.stop_file.exists() {
                tracing::info!(path = %self.settings.stop_file.display(), "stop file found, exiting");
                break StopReason::StopFile;
            }

            let remaining = remaining_in_tick(started, self.settings.interval, Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break StopReason::Signal;
                }
            }
        };

        self.storage.close().context("failed to close database")?;
        tracing::info!(ticks, "database closed");
        Ok(RunSummary { ticks, reason })
    }

    fn log_heartbeat(&self) {
        let stats = self.pipeline.stats();
        tracing::info!(
            ticks = stats.ticks,
            records = stats.records,
            events = stats.events,
            status_rows = stats.status_rows,
            commit_failures = stats.commit_failures,
            last_snap = ?self.cursor.last_snap,
            "bridge heartbeat"
        );
    }
}

pub async fn run(config: Config) -> Result<()> {
    let endpoint = Endpoint::parse(&config.server).context("invalid BRIDGE_SERVER")?;
    let catalog = ParameterCatalog::from_path(&config.catalog_path)
        .context("failed to load parameter catalog")?;
    let credentials = Credentials::from_secrets_file(&config.secrets_file, endpoint.host())
        .context("failed to load credentials")?;

    let storage = Storage::connect(&config.db_path, &config.storage_options())
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    warn_on_schema_lag(&storage);
    let persisted = storage
        .read_status()
        .context("failed to read station status")?;
    let pipeline = Pipeline::from_catalog(
        &catalog,
        persisted,
        PipelineOptions {
            add_points: config.add_points,
            dedupe_events: config.dedupe_events,
        },
    );

    let client = ApiClient::new(
        endpoint,
        credentials,
        config.http_timeout(),
        RetryPolicy::forever(config.session_retry()),
    )
    .context("failed to build http client")?;
    let cursor_file = CursorFile::for_host(&config.state_dir, client.endpoint().host());
    let prior = cursor_file.load()?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let prior_session = prior.as_ref().map(|c| c.sessionid.as_str());
    let sessionid = tokio::select! {
        session = client.acquire_session(prior_session) => session?,
        _ = &mut shutdown => {
            tracing::info!("shutdown requested before a session was established");
            storage.close().context("failed to close database")?;
            return Ok(());
        }
    };
    let cursor = Cursor {
        sessionid,
        last_snap: prior.and_then(|c| c.last_snap),
    };
    cursor_file.save(&cursor).context("failed to write cursor file")?;

    tracing::info!(
        server = %client.endpoint().host(),
        db = %config.db_path.display(),
        interval_secs = config.poll_interval_secs,
        last_snap = ?cursor.last_snap,
        "bridge running"
    );

    let bridge = Bridge::new(
        client,
        pipeline,
        storage,
        cursor_file,
        cursor,
        LoopSettings::from_config(&config),
    );
    let summary = bridge.run_until(shutdown).await?;
    tracing::info!(ticks = summary.ticks, reason = ?summary.reason, "bridge stopped");
    Ok(())
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn warn_on_schema_lag(storage: &Storage) {
    match migrations::plan(storage.connection()) {
        Ok(steps) => {
            let outstanding: Vec<String> = steps
                .iter()
                .filter(|step| step.disposition != Disposition::Recorded)
                .map(|step| step.migration.label())
                .collect();
            if !outstanding.is_empty() {
                tracing::warn!(?outstanding, "database has unrecorded migrations; run vlbimon-migrate");
            }
        }
        Err(err) => tracing::warn!(error = %err, "database schema does not match any known migration state"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
