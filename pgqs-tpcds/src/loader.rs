//! Loading the TPC-DS dataset into the target server.
//!
//! The preparation script builds `dsdgen`, generates the raw `.dat` files and
//! writes cleaned copies (trailing delimiter stripped) into a `tables/`
//! directory. The loader discovers tables from the raw files and streams the
//! cleaned copies through `COPY ... FROM STDIN`.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_postgres::Client;

use crate::connection::{ConnectionConfig, PgConnection};
use crate::{Result, StressPaths, TpcdsError, read_file};

const DATA_FILE_EXTENSION: &str = "dat";
const COPY_DELIMITER: char = '|';
const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Progress notifications emitted while tables are loaded.
#[derive(Debug, Clone, Copy)]
pub enum TableLoadEvent<'a> {
    Begin {
        table: &'a str,
    },
    Complete {
        table: &'a str,
        rows: u64,
        elapsed: Duration,
    },
}

/// Rows copied into one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLoadSummary {
    pub table: String,
    pub file_name: String,
    pub rows: u64,
}

/// Summary of a completed load.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub tables: Vec<TableLoadSummary>,
}

impl LoadSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|entry| entry.rows).sum()
    }
}

/// A table whose row count disagrees with its data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCountMismatch {
    pub table: String,
    pub expected: u64,
    pub actual: u64,
}

/// Prepare the dataset and load it into the server described by `config`.
///
/// The extension, schema and every table are created inside one transaction.
/// Any failure after the preparation script closes the connection, which
/// rolls the transaction back, and is reported as [`TpcdsError::DataLoad`].
pub async fn setup_tpcds<F>(
    config: &ConnectionConfig,
    paths: &StressPaths,
    mut on_progress: F,
) -> Result<LoadSummary>
where
    F: FnMut(TableLoadEvent<'_>),
{
    println!("Setting up TPC-DS test...");
    run_prepare_script(paths).await;

    let conn = PgConnection::open(config)
        .await
        .map_err(TpcdsError::load_failed)?;
    let loaded = load_dataset(conn.client(), paths, &mut on_progress).await;
    conn.close().await;

    let summary = loaded.map_err(TpcdsError::load_failed)?;
    println!("done!");
    Ok(summary)
}

/// Run the preparation script from `paths.root`, where it creates `tmp_stress/`.
///
/// The exit status is reported but never fatal.
pub async fn run_prepare_script(paths: &StressPaths) {
    let script = std::path::absolute(&paths.prepare_script)
        .unwrap_or_else(|_| paths.prepare_script.clone());
    let status = Command::new(&script)
        .current_dir(&paths.root)
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            tracing::info!(target: "tpcds-loader", script = %script.display(), "preparation finished");
        }
        Ok(status) => {
            tracing::warn!(
                target: "tpcds-loader",
                script = %script.display(),
                %status,
                "preparation script exited unsuccessfully"
            );
        }
        Err(err) => {
            tracing::warn!(
                target: "tpcds-loader",
                script = %script.display(),
                root = %paths.root.display(),
                "failed to spawn preparation script: {err}"
            );
        }
    }
}

async fn load_dataset<F>(
    client: &Client,
    paths: &StressPaths,
    on_progress: &mut F,
) -> Result<LoadSummary>
where
    F: FnMut(TableLoadEvent<'_>),
{
    client.batch_execute("BEGIN").await?;
    client
        .batch_execute("CREATE EXTENSION IF NOT EXISTS pg_query_state")
        .await?;

    let schema_sql = read_file(&paths.schema_sql)?;
    client.batch_execute(&schema_sql).await?;

    let mut summary = LoadSummary::default();
    for file_name in discover_data_files(&paths.generated_dir)? {
        let table = table_name_for(&file_name);
        println!("Loading table {table}");
        on_progress(TableLoadEvent::Begin { table: &table });

        let started = Instant::now();
        let rows = copy_table(client, &table, &paths.table_file(&file_name)).await?;
        tracing::debug!(target: "tpcds-loader", table = %table, rows, "table loaded");
        on_progress(TableLoadEvent::Complete {
            table: &table,
            rows,
            elapsed: started.elapsed(),
        });
        summary.tables.push(TableLoadSummary {
            table,
            file_name,
            rows,
        });
    }

    client.batch_execute("COMMIT").await?;
    Ok(summary)
}

async fn copy_table(client: &Client, table: &str, data_file: &Path) -> Result<u64> {
    let statement = format!(
        "COPY {} FROM STDIN WITH (FORMAT text, DELIMITER '{COPY_DELIMITER}', NULL '')",
        quote_identifier(table)
    );
    let mut file = tokio::fs::File::open(data_file)
        .await
        .map_err(|source| TpcdsError::io(data_file, source))?;

    let sink = client.copy_in::<_, Bytes>(statement.as_str()).await?;
    futures::pin_mut!(sink);
    let mut buf = BytesMut::with_capacity(COPY_CHUNK_BYTES);
    loop {
        let read = file
            .read_buf(&mut buf)
            .await
            .map_err(|source| TpcdsError::io(data_file, source))?;
        if read == 0 {
            break;
        }
        if buf.len() >= COPY_CHUNK_BYTES {
            sink.send(buf.split().freeze()).await?;
            buf.reserve(COPY_CHUNK_BYTES);
        }
    }
    if !buf.is_empty() {
        sink.send(buf.freeze()).await?;
    }
    Ok(sink.finish().await?)
}

/// List the `.dat` files of `dir`, sorted by name.
pub fn discover_data_files(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|source| TpcdsError::io(dir, source))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TpcdsError::io(dir, source))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_data = path
            .extension()
            .is_some_and(|ext| ext == DATA_FILE_EXTENSION);
        if is_data && let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Derive the target table from a data file name (`store_sales.dat` -> `store_sales`).
pub fn table_name_for(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name)
        .to_string()
}

/// Count the rows `COPY` will see in a text-format data file.
pub fn count_data_rows(path: &Path) -> Result<u64> {
    let file = fs::File::open(path).map_err(|source| TpcdsError::io(path, source))?;
    let mut rows = 0u64;
    for line in BufReader::new(file).split(b'\n') {
        line.map_err(|source| TpcdsError::io(path, source))?;
        rows += 1;
    }
    Ok(rows)
}

/// Compare the row count of each loaded table with its prepared data file.
pub async fn verify_row_counts(
    config: &ConnectionConfig,
    paths: &StressPaths,
    summary: &LoadSummary,
) -> Result<Vec<RowCountMismatch>> {
    let conn = PgConnection::open(config).await?;
    let checked = check_tables(conn.client(), paths, summary).await;
    conn.close().await;
    checked
}

async fn check_tables(
    client: &Client,
    paths: &StressPaths,
    summary: &LoadSummary,
) -> Result<Vec<RowCountMismatch>> {
    let mut mismatches = Vec::new();
    for entry in &summary.tables {
        let data_file: PathBuf = paths.table_file(&entry.file_name);
        let expected = count_data_rows(&data_file)?;
        let sql = format!("SELECT count(*) FROM {}", quote_identifier(&entry.table));
        let row = client.query_one(sql.as_str(), &[]).await?;
        let actual: i64 = row.try_get(0)?;
        let actual = u64::try_from(actual).unwrap_or_default();
        if actual != expected {
            tracing::warn!(
                target: "tpcds-loader",
                table = %entry.table,
                expected,
                actual,
                "row count mismatch"
            );
            mismatches.push(RowCountMismatch {
                table: entry.table.clone(),
                expected,
                actual,
            });
        }
    }
    Ok(mismatches)
}

fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
