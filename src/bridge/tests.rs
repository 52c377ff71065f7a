use super::{remaining_in_tick, Bridge, LoopSettings, StopReason};
use crate::catalog::ParameterCatalog;
use crate::client::auth::Credentials;
use crate::client::test_server::spawn;
use crate::client::{ApiClient, Endpoint, FetchOutcome, RetryPolicy};
use crate::cursor::{Cursor, CursorFile};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::storage::tables::STATUS_TABLE;
use crate::storage::{initialize_schema, Storage, StorageOptions};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const NEXT_SNAP: i64 = 1_700_000_100;

#[derive(Clone, Default)]
struct Upstream {
    snapshots: Arc<AtomicUsize>,
}

fn session_of(headers: &HeaderMap) -> String {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|kv| kv.strip_prefix("sessionid="))
        })
        .unwrap_or_default()
        .to_string()
}

/// Session `once` is served a single snapshot and rejected afterwards.
async fn snapshot(State(upstream): State<Upstream>, headers: HeaderMap) -> Response {
    let served = upstream.snapshots.fetch_add(1, Ordering::SeqCst);
    if session_of(&headers) == "once" && served > 0 {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        [(header::SET_COOKIE, format!("snap_recvTime={NEXT_SNAP}; Path=/"))],
        Json(json!({
            "ALMA": {"data": {"telescope_sourceName": [1700000090, "M87"]}}
        })),
    )
        .into_response()
}

async fn upstream() -> String {
    let app = Router::new()
        .route("/data/snapshot", get(snapshot))
        .route("/session", post(|| async { Json(json!({"id": "renewed"})) }))
        .with_state(Upstream::default());
    spawn(app).await
}

struct Harness {
    dir: TempDir,
    db_path: PathBuf,
    cursor_file: CursorFile,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("vlbimon.db");
        initialize_schema(&db_path, &catalog().column_types(), &StorageOptions::default())
            .unwrap();
        let cursor_file = CursorFile::for_host(dir.path(), "127.0.0.1");
        Self {
            dir,
            db_path,
            cursor_file,
        }
    }

    fn stop_file(&self) -> PathBuf {
        self.dir.path().join("PLEASE-STOP")
    }

    fn bridge(&self, base: &str, cursor: Cursor, interval: Duration) -> Bridge {
        self.cursor_file.save(&cursor).unwrap();
        let storage = Storage::connect(&self.db_path, &StorageOptions::default()).unwrap();
        let pipeline = Pipeline::from_catalog(
            &catalog(),
            storage.read_status().unwrap(),
            PipelineOptions::default(),
        );
        let client = ApiClient::new(
            Endpoint::parse(base).unwrap(),
            Credentials::Basic {
                username: "u".into(),
                password: "p".into(),
            },
            Duration::from_secs(5),
            RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_attempts: Some(2),
            },
        )
        .unwrap();
        Bridge::new(
            client,
            pipeline,
            storage,
            self.cursor_file.clone(),
            cursor,
            LoopSettings {
                interval,
                heartbeat: Duration::from_secs(300),
                stop_file: self.stop_file(),
            },
        )
    }
}

fn catalog() -> ParameterCatalog {
    let mut json = br#"{
        "default": {"telescope_sourceName": {"datatype": "string"}},
        "ALMA": {}
    }"#
    .to_vec();
    ParameterCatalog::from_json_bytes(&mut json).unwrap()
}

fn cursor(session: &str, last_snap: i64) -> Cursor {
    Cursor {
        sessionid: session.to_string(),
        last_snap: Some(last_snap),
    }
}

fn rename_table(bridge: &Bridge, from: &str, to: &str) {
    bridge
        .storage()
        .connection()
        .execute(&format!("ALTER TABLE {from} RENAME TO {to}"), [])
        .unwrap();
}

#[test]
fn sleep_covers_only_the_rest_of_the_tick() {
    let started = Instant::now();
    let interval = Duration::from_secs(10);
    assert_eq!(
        remaining_in_tick(started, interval, started + Duration::from_secs(3)),
        Duration::from_secs(7)
    );
    assert_eq!(
        remaining_in_tick(started, interval, started + Duration::from_secs(12)),
        Duration::ZERO
    );
}

#[tokio::test]
async fn committed_tick_persists_the_new_cursor() {
    let base = upstream().await;
    let harness = Harness::new();
    let mut bridge = harness.bridge(&base, cursor("live", 42), Duration::from_secs(10));

    let report = bridge.tick().await.unwrap();
    assert_eq!(report.outcome, FetchOutcome::Snapshot);
    assert!(report.committed);
    assert_eq!(report.stats.events, 1);
    assert_eq!(bridge.cursor(), &cursor("live", NEXT_SNAP));
    assert_eq!(
        harness.cursor_file.load().unwrap(),
        Some(cursor("live", NEXT_SNAP))
    );
}

#[tokio::test]
async fn failed_commit_keeps_cursor_file_but_adopts_renewed_session() {
    let base = upstream().await;
    let harness = Harness::new();
    let mut bridge = harness.bridge(&base, cursor("once", 42), Duration::from_secs(10));
    rename_table(&bridge, STATUS_TABLE, "parked");

    let first = bridge.tick().await.unwrap();
    assert!(!first.committed);
    assert_eq!(bridge.cursor(), &cursor("once", 42));
    assert_eq!(harness.cursor_file.load().unwrap(), Some(cursor("once", 42)));

    // the server now rejects the session; the requeued status rows fail again
    let second = bridge.tick().await.unwrap();
    assert_eq!(second.outcome, FetchOutcome::Reauthenticated);
    assert!(!second.committed);
    assert_eq!(bridge.cursor(), &cursor("renewed", 42));
    assert_eq!(harness.cursor_file.load().unwrap(), Some(cursor("once", 42)));

    rename_table(&bridge, "parked", STATUS_TABLE);
    let third = bridge.tick().await.unwrap();
    assert!(third.committed);
    assert_eq!(third.stats.events, 1);
    assert_eq!(
        harness.cursor_file.load().unwrap(),
        Some(cursor("renewed", NEXT_SNAP))
    );
    assert_eq!(bridge.pipeline().stats().commit_failures, 2);
}

#[tokio::test]
async fn stop_file_ends_the_loop_after_one_tick_and_closes_storage() {
    let base = upstream().await;
    let harness = Harness::new();
    std::fs::write(harness.stop_file(), b"").unwrap();
    let bridge = harness.bridge(&base, cursor("live", 42), Duration::from_secs(60));

    let started = Instant::now();
    let summary = bridge
        .run_until(std::future::pending::<()>())
        .await
        .unwrap();
    assert_eq!(summary.ticks, 1);
    assert_eq!(summary.reason, StopReason::StopFile);
    // the 60s cadence sleep was never entered
    assert!(started.elapsed() < Duration::from_secs(30));

    // the last connection is gone, so sqlite has folded the WAL back in
    let mut wal = harness.db_path.clone().into_os_string();
    wal.push("-wal");
    assert!(!PathBuf::from(wal).exists());
    let reopened = Storage::connect(&harness.db_path, &StorageOptions::default()).unwrap();
    let rows: i64 = reopened
        .connection()
        .query_row("SELECT COUNT(*) FROM ts_param_telescope_sourceName", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn shutdown_interrupts_the_cadence_sleep() {
    let base = upstream().await;
    let harness = Harness::new();
    let bridge = harness.bridge(&base, cursor("live", 42), Duration::from_secs(60));

    let started = Instant::now();
    let summary = bridge
        .run_until(tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(summary.reason, StopReason::Signal);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(
        harness.cursor_file.load().unwrap(),
        Some(cursor("live", NEXT_SNAP))
    );
}
