use crate::catalog::ParameterCatalog;
use crate::record::FlatRecord;
use crate::snapshot::{self, FlattenOptions, ParameterTables, BRIDGE_STATION};
use crate::status::{StationStatus, StatusAggregator};
use crate::storage::{CommitSummary, Storage, StorageError};
use crate::transform::{EventChanges, Transformer, EVENTS_PARAM};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;


#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub add_points: bool,
    pub dedupe_events: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            add_points: true,
            dedupe_events: true,
        }
    }
}

/// Counts for one tick, logged by the run loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub stations: usize,
    pub records: usize,
    pub events: usize,
    pub status_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TickBatch {
    pub tables: ParameterTables,
    pub status_rows: Vec<StationStatus>,
    /// Dedup cache updates to undo if this batch fails to commit.
    pub event_changes: EventChanges,
    pub stats: TickStats,
}

/// Running totals since startup, reported in the heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub ticks: u64,
    pub records: u64,
    pub events: u64,
    pub status_rows: u64,
    pub commit_failures: u64,
}

/// fetch -> flatten -> transform -> aggregate; owns the state carried
/// between ticks.
pub struct Pipeline {
    transformer: Transformer,
    aggregator: StatusAggregator,
    options: PipelineOptions,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        transformer: Transformer,
        aggregator: StatusAggregator,
        options: PipelineOptions,
    ) -> Self {
        Self {
            transformer,
            aggregator,
            options,
            stats: PipelineStats::default(),
        }
    }

    pub fn from_catalog(
        catalog: &ParameterCatalog,
        persisted: Vec<StationStatus>,
        options: PipelineOptions,
    ) -> Self {
        let seeded = persisted.len();
        let aggregator = StatusAggregator::seeded(persisted, &catalog.stations);
        tracing::info!(
            seeded,
            stations = catalog.stations.len(),
            "status aggregator seeded"
        );
        Self::new(Transformer::from_catalog(catalog), aggregator, options)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// Turns one snapshot into the rows to commit for this tick.
    pub fn process(&mut self, snapshot: &JsonValue, now: f64) -> TickBatch {
        let flat = snapshot::flatten(
            snapshot,
            FlattenOptions {
                add_points: self.options.add_points,
            },
            now,
        );
        let records = self.transformer.transform(flat, self.options.dedupe_events);
        let event_changes = self.transformer.take_changes();
        self.aggregator.apply(&records);
        let status_rows = self.aggregator.take_changed();

        let stats = TickStats {
            stations: count_stations(&records),
            records: records.len(),
            events: records
                .iter()
                .filter(|r| r.parameter == EVENTS_PARAM)
                .count(),
            status_rows: status_rows.len(),
        };
        TickBatch {
            tables: snapshot::partition(&records),
            status_rows,
            event_changes,
            stats,
        }
    }

    /// Commits a batch. On failure the status rows are queued again and the
    /// batch's events are forgotten by the dedup cache, so a re-fetch of the
    /// same window reproduces them.
    pub fn commit(
        &mut self,
        storage: &mut Storage,
        batch: &TickBatch,
    ) -> Result<CommitSummary, StorageError> {
        match storage.commit_batch(&batch.tables, &batch.status_rows) {
            Ok(summary) => {
                self.stats.ticks += 1;
                self.stats.records += summary.rows as u64;
                self.stats.events += batch.stats.events as u64;
                self.stats.status_rows += summary.status_rows as u64;
                Ok(summary)
            }
            Err(err) => {
                self.stats.commit_failures += 1;
                self.aggregator.restore_changed(&batch.status_rows);
                self.transformer.rollback(&batch.event_changes);
                Err(err)
            }
        }
    }
}

fn count_stations(records: &[FlatRecord]) -> usize {
    records
        .iter()
        .map(|r| r.station.as_str())
        .filter(|station| *station != BRIDGE_STATION)
        .collect::<BTreeSet<_>>()
        .len()
}
