//! Tests against a real server. They run only when `PGQS_TEST_DSN` points at a
//! database where `pg_query_state` can be created.

use std::fs;
use std::path::Path;

use pgqs_tpcds::{
    ConnectionConfig, PgConnection, PgQueryStateProbe, PgStressSession, QuerySet, RunOptions,
    StressPaths, StressRunner, TpcdsError, setup_tpcds, verify_row_counts,
};
use pgqs_test_utils::{init_tracing_for_tests, live_dsn};
use tempfile::TempDir;

fn live_config() -> Option<ConnectionConfig> {
    init_tracing_for_tests();
    let dsn = live_dsn()?;
    Some(dsn.parse().expect("PGQS_TEST_DSN must be a valid connection string"))
}

fn write_fixture(root: &Path, schema: &str, tables: &[(&str, &str)]) -> StressPaths {
    let paths = StressPaths::from_root(root);
    fs::create_dir_all(&paths.tables_dir).unwrap();
    fs::create_dir_all(&paths.queries_dir).unwrap();
    fs::write(&paths.schema_sql, schema).unwrap();
    for (file_name, contents) in tables {
        // dsdgen output keeps a trailing delimiter; the prepared copy drops it.
        let raw: String = contents.lines().map(|line| format!("{line}|\n")).collect();
        fs::write(paths.generated_dir.join(file_name), raw).unwrap();
        fs::write(paths.table_file(file_name), contents).unwrap();
    }
    paths
}

async fn drop_tables(config: &ConnectionConfig, tables: &[&str]) {
    let conn = PgConnection::open(config).await.expect("connect");
    for table in tables {
        conn.client()
            .batch_execute(&format!("DROP TABLE IF EXISTS {table}"))
            .await
            .expect("drop table");
    }
    conn.close().await;
}

const SCHEMA: &str = "\
DROP TABLE IF EXISTS pgqs_live_store;
DROP TABLE IF EXISTS pgqs_live_item;
CREATE TABLE pgqs_live_store (s_id integer, s_name text);
CREATE TABLE pgqs_live_item (i_id integer, i_desc text, i_price numeric);
";

#[tokio::test]
async fn setup_loads_every_data_file() {
    let Some(config) = live_config() else {
        return;
    };
    let dir = TempDir::new().expect("tempdir");
    let paths = write_fixture(
        dir.path(),
        SCHEMA,
        &[
            ("pgqs_live_store.dat", "1|north\n2|\n3|south\n"),
            ("pgqs_live_item.dat", "10|widget|1.50\n11||\n"),
        ],
    );

    let mut begun = Vec::new();
    let summary = setup_tpcds(&config, &paths, |event| {
        if let pgqs_tpcds::TableLoadEvent::Begin { table } = event {
            begun.push(table.to_string());
        }
    })
    .await
    .expect("setup");

    assert_eq!(begun, vec!["pgqs_live_item", "pgqs_live_store"]);
    assert_eq!(summary.total_rows(), 5);
    let mismatches = verify_row_counts(&config, &paths, &summary)
        .await
        .expect("verify");
    assert!(mismatches.is_empty(), "{mismatches:?}");

    drop_tables(&config, &["pgqs_live_store", "pgqs_live_item"]).await;
}

#[tokio::test]
async fn malformed_data_is_a_load_failure() {
    let Some(config) = live_config() else {
        return;
    };
    let dir = TempDir::new().expect("tempdir");
    let paths = write_fixture(
        dir.path(),
        "CREATE TABLE pgqs_live_broken (b_id integer, b_name text);",
        &[("pgqs_live_broken.dat", "not-a-number|north\n")],
    );

    let err = setup_tpcds(&config, &paths, |_| {}).await.unwrap_err();
    match &err {
        TpcdsError::DataLoad { message, .. } => assert!(message.starts_with("Load failed: ")),
        other => panic!("unexpected error: {other}"),
    }

    // The failed transaction must not leave the schema behind.
    let conn = PgConnection::open(&config).await.expect("connect");
    let row = conn
        .client()
        .query_one("SELECT to_regclass('pgqs_live_broken') IS NULL", &[])
        .await
        .expect("lookup");
    let missing: bool = row.get(0);
    conn.close().await;
    assert!(missing);
}

#[tokio::test]
async fn statement_timeout_is_recorded_for_slow_query() {
    let Some(config) = live_config() else {
        return;
    };
    let setup = PgConnection::open(&config).await.expect("connect");
    setup
        .client()
        .batch_execute("CREATE EXTENSION IF NOT EXISTS pg_query_state")
        .await
        .expect("create extension");
    setup.close().await;

    let queries = QuerySet::from_texts(["SELECT 1", "SELECT pg_sleep(5)"]);
    let options = RunOptions {
        statement_timeout_ms: 1_000,
        ..RunOptions::default()
    };
    let probe = PgQueryStateProbe::with_options(config.clone(), options.query_state);
    let session = PgStressSession::connect(&config).await.expect("session");
    let runner = StressRunner::new(probe, options);

    let report = runner
        .run(session, &queries, |_| {})
        .await
        .expect("stress run");

    assert_eq!(report.timeouts, vec![2]);
    assert_eq!(report.completed, vec![1]);
}
