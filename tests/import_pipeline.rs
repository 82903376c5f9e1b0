//! End-to-end import runs against real files and a real SQLite database.
//!
//! Counts are checked through a separate rusqlite connection so the
//! assertions do not depend on the repository code under test.

use std::path::PathBuf;

use rusqlite::Connection;
use tempfile::TempDir;
use tokio::sync::mpsc;

use listing_import::import::{
    open_source, BatchRunner, ColumnMapping, DbProgressStore, FileProgressStore, InMemorySource,
    PartitionMode, ProgressStore, RecordNormalizer, RunContext, RunEvent, RunSummary,
    RunnerConfig, SourceReader,
};
use listing_import::models::SourceRecord;
use listing_import::repository::DbContext;

struct Workspace {
    dir: TempDir,
    db: DbContext,
}

impl Workspace {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = DbContext::new(&dir.path().join("listings.db"));
        db.init_schema().await.unwrap();
        Self { dir, db }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("listings.db")
    }

    fn store(&self) -> FileProgressStore {
        FileProgressStore::for_run(&self.dir.path().join("checkpoints"), "listings")
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn sqlite(&self) -> Connection {
        Connection::open(self.db_path()).unwrap()
    }

    async fn run(&self, source: Box<dyn SourceReader>, config: RunnerConfig) -> RunSummary {
        self.run_with_store(source, config, Box::new(self.store()))
            .await
    }

    async fn run_with_store(
        &self,
        source: Box<dyn SourceReader>,
        config: RunnerConfig,
        store: Box<dyn ProgressStore>,
    ) -> RunSummary {
        let ctx = RunContext::new(
            self.db.clone(),
            RecordNormalizer::default(),
            config.idempotency_key,
        );
        BatchRunner::new(config, ctx, source, store)
            .run()
            .await
            .unwrap()
    }
}

fn config(batch_size: usize) -> RunnerConfig {
    RunnerConfig {
        batch_size,
        pause_ms: 0,
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        ..Default::default()
    }
}

fn listing(name: &str, address: &str, city: &str, state: &str) -> SourceRecord {
    SourceRecord {
        address: Some(address.to_string()),
        ..SourceRecord::new(name, city, state)
    }
}

fn colorado() -> Box<dyn SourceReader> {
    Box::new(InMemorySource::new(
        "colorado",
        vec![
            listing("Suds City", "1 Main St", "Denver", "CO"),
            listing("Bubble Bath", "2 Main St", "Denver", "co"),
            listing("Spin Cycle", "3 Pearl St", "Boulder", "Colorado"),
        ],
    ))
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

/// Every stored dimension count equals the number of listings referencing it.
fn assert_counts_consistent(conn: &Connection) {
    let stale_states = count(
        conn,
        "SELECT COUNT(*) FROM states s
         WHERE s.listing_count != (SELECT COUNT(*) FROM listings l WHERE l.state_id = s.id)",
    );
    let stale_cities = count(
        conn,
        "SELECT COUNT(*) FROM cities c
         WHERE c.listing_count != (SELECT COUNT(*) FROM listings l WHERE l.city_id = c.id)",
    );
    assert_eq!(stale_states, 0, "state counts out of sync");
    assert_eq!(stale_cities, 0, "city counts out of sync");
}

fn city_counts(conn: &Connection) -> Vec<(String, i64)> {
    let mut stmt = conn
        .prepare("SELECT name, listing_count FROM cities ORDER BY name")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn colorado_scenario() {
    let ws = Workspace::new().await;
    let summary = ws.run(colorado(), config(2)).await;

    assert!(summary.completed);
    assert_eq!(summary.imported, 3);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM states"), 1);
    assert_eq!(
        count(&conn, "SELECT listing_count FROM states WHERE abbreviation = 'CO'"),
        3
    );
    assert_eq!(
        city_counts(&conn),
        vec![("Boulder".to_string(), 1), ("Denver".to_string(), 2)]
    );
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings"), 3);
    assert_counts_consistent(&conn);

    let checkpoint = ws.store().load().await.unwrap();
    assert_eq!(checkpoint.position, 3);
    assert_eq!(checkpoint.total_imported, 3);
    assert!(checkpoint.done);
}

#[tokio::test]
async fn rerun_inserts_nothing() {
    let ws = Workspace::new().await;
    ws.run(colorado(), config(2)).await;

    let again = ws
        .run(
            colorado(),
            RunnerConfig {
                restart: true,
                ..config(2)
            },
        )
        .await;
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 3);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings"), 3);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM cities"), 2);
    assert_counts_consistent(&conn);
}

#[tokio::test]
async fn checkpoint_behind_committed_data_only_skips() {
    let ws = Workspace::new().await;
    ws.run(colorado(), config(3)).await;

    // A checkpoint from an older build that fell one batch behind.
    let store = ws.store();
    std::fs::write(
        store.path(),
        r#"{"position": 1, "totalImported": 1, "legacyField": {"nested": true}}"#,
    )
    .unwrap();

    let summary = ws.run(colorado(), config(3)).await;
    assert!(summary.completed);
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.skipped, 2);

    let checkpoint = store.load().await.unwrap();
    assert_eq!(checkpoint.position, 3);
    assert_eq!(checkpoint.total_imported, 1);
    assert_eq!(checkpoint.total_skipped, 2);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings"), 3);
    assert_counts_consistent(&conn);
}

#[tokio::test]
async fn csv_import_resumes_after_limit() {
    let ws = Workspace::new().await;
    let path = ws.write(
        "listings.csv",
        "Business Name,Street Address,City,State,Zip\n\
         Suds City,1 Main St,Denver,CO,80202\n\
         Bubble Bath,\"2 Main St, Unit B\",Denver,CO,80202\n\
         Spin Cycle,3 Pearl St,Boulder,CO,80302\n\
         Clean Scene,4 Elm St,Austin,TX,73301\n\
         Fresh Fold,5 Oak St,Austin,TX,73301\n",
    );
    let open = || open_source(&path, &ColumnMapping::default()).unwrap();

    let first = ws
        .run(
            open(),
            RunnerConfig {
                max_records: Some(2),
                ..config(2)
            },
        )
        .await;
    assert!(first.stopped);
    assert!(!first.completed);
    assert_eq!(first.imported, 2);
    assert_eq!(ws.store().load().await.unwrap().position, 2);

    let second = ws.run(open(), config(2)).await;
    assert!(second.completed);
    assert_eq!(second.imported, 3);
    assert_eq!(second.skipped, 0);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings"), 5);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM states"), 2);
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM listings WHERE address = '2 Main St, Unit B'"
        ),
        1
    );
    assert_counts_consistent(&conn);
}

#[tokio::test]
async fn bad_rows_are_isolated() {
    let ws = Workspace::new().await;
    let path = ws.write(
        "listings.jsonl",
        concat!(
            r#"{"name": "Suds City", "address": "1 Main St", "city": "Denver", "state": "CO"}"#,
            "\n",
            r#"{"name": "Broken", "city": "#,
            "\n",
            r#"{"name": "", "address": "9 Nowhere", "city": "Denver", "state": "CO"}"#,
            "\n",
            r#"{"name": "Spin Cycle", "address": "3 Pearl St", "city": "Boulder", "state": "CO"}"#,
            "\n",
        ),
    );
    let source = open_source(&path, &ColumnMapping::default()).unwrap();
    let summary = ws.run(source, config(10)).await;

    assert!(summary.completed);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.errors, 2);

    let offsets: Vec<Option<u64>> = summary
        .checkpoint
        .errors
        .iter()
        .map(|e| e.offset)
        .collect();
    assert_eq!(offsets, vec![Some(1), Some(2)]);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings"), 2);
    assert_counts_consistent(&conn);
}

#[tokio::test]
async fn state_partitions_are_processed_in_order() {
    let ws = Workspace::new().await;
    let path = ws.write(
        "shuffled.csv",
        "name,address,city,state\n\
         Wy One,1 A St,Cheyenne,WY\n\
         Co One,1 B St,Denver,CO\n\
         Tx One,1 C St,Austin,Texas\n\
         Co Two,2 B St,Boulder,Colorado\n\
         Wy Two,2 A St,Casper,wy\n\
         Co Three,3 B St,Denver,CO\n",
    );
    let source = open_source(&path, &ColumnMapping::default()).unwrap();

    let (tx, mut rx) = mpsc::channel(256);
    let cfg = RunnerConfig {
        partition: PartitionMode::State,
        ..config(2)
    };
    let ctx = RunContext::new(ws.db.clone(), RecordNormalizer::default(), cfg.idempotency_key);
    let summary = BatchRunner::new(cfg, ctx, source, Box::new(ws.store()))
        .with_events(tx)
        .run()
        .await
        .unwrap();
    assert!(summary.completed);
    assert_eq!(summary.imported, 6);

    let mut partitions = Vec::new();
    while let Some(event) = rx.recv().await {
        if let RunEvent::BatchCommitted { partition, .. } = event {
            partitions.push(partition.unwrap());
        }
    }
    // CO fills one batch of two and spills into a second; batches never mix states.
    assert_eq!(partitions, vec!["CO", "CO", "TX", "WY"]);

    let conn = ws.sqlite();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM states"), 3);
    assert_eq!(
        count(&conn, "SELECT listing_count FROM states WHERE abbreviation = 'WY'"),
        2
    );
    assert_counts_consistent(&conn);
}

#[tokio::test]
async fn state_filter_limits_the_run() {
    let ws = Workspace::new().await;
    let path = ws.write(
        "mixed.csv",
        "name,address,city,state\n\
         Wy One,1 A St,Cheyenne,WY\n\
         Co One,1 B St,Denver,CO\n\
         Wy Two,2 A St,Casper,Wyoming\n",
    );
    let source = open_source(&path, &ColumnMapping::default()).unwrap();
    let summary = ws
        .run(
            source,
            RunnerConfig {
                states: vec!["wy".to_string()],
                ..config(10)
            },
        )
        .await;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.imported, 2);
    let conn = ws.sqlite();
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM states WHERE abbreviation = 'CO'"),
        0
    );
}

#[tokio::test]
async fn database_checkpoint_backend() {
    let ws = Workspace::new().await;
    let store = DbProgressStore::new(ws.db.checkpoints(), "db-run");
    let summary = ws
        .run_with_store(colorado(), config(2), Box::new(store.clone()))
        .await;
    assert!(summary.completed);

    let conn = ws.sqlite();
    let data: String = conn
        .query_row(
            "SELECT data FROM import_checkpoints WHERE run_key = 'db-run'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(json["position"], 3);
    assert_eq!(json["totalImported"], 3);
    assert_eq!(json["done"], true);

    assert!(store.load().await.unwrap().done);
}

#[tokio::test]
async fn missing_source_file_is_an_error() {
    let ws = Workspace::new().await;
    let result = open_source(
        &ws.dir.path().join("nope.csv"),
        &ColumnMapping::default(),
    );
    assert!(result.is_err());
    assert!(!ws.store().path().exists());
}
