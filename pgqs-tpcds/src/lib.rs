//! TPC-DS stress tooling for the `pg_query_state` extension.
//!
//! The crate drives a PostgreSQL server from the outside. [`setup_tpcds`]
//! prepares the benchmark dataset (schema plus pipe-delimited table files
//! produced by `dsdgen`), and [`run_tpcds`] replays the TPC-DS query set one
//! statement at a time while a second connection keeps calling
//! `pg_query_state` against the busy backend. A crash or hang of the server
//! surfaces as an error from the run.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod connection;
pub mod loader;
pub mod probe;
pub mod queries;
pub mod stress;

pub use connection::{ConnectionConfig, Notice, PgConnection};
pub use loader::{
    LoadSummary, RowCountMismatch, TableLoadEvent, TableLoadSummary, setup_tpcds, verify_row_counts,
};
pub use probe::{
    PgQueryStateProbe, PollResult, QueryStateFormat, QueryStateOptions, QueryStateProbe,
    QueryStateRow,
};
pub use queries::{ExcludeList, QuerySet, StressQuery, load_query_set};
pub use stress::{
    Observation, PgStressSession, PollPolicy, QueryOutcome, RunOptions, StressEvent,
    StressReport, StressRunner, StressSession, observe_query_state, run_tpcds,
};

const STRESS_ROOT: &str = "tmp_stress";
const PREPARE_SCRIPT: &str = "tests/prepare_stress.sh";
const TPCDS_TOOLS_DIR: &str = "tpcds-kit/tools";
const TPCDS_SCHEMA_FILE: &str = "tpcds.sql";
const PREPARED_TABLES_DIR: &str = "tables";
const QUERY_QUALIFICATION_DIR: &str = "tpcds-result-reproduction/query_qualification";

/// Errors produced by the loader and the stress runner.
#[derive(Debug, Error)]
pub enum TpcdsError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {0}")]
    Parse(String),
    #[error("PostgreSQL request failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("{message}")]
    DataLoad {
        message: String,
        #[source]
        source: Box<TpcdsError>,
    },
    #[error("row count verification failed: {0}")]
    Verification(String),
    #[error("stress test failed: {0}")]
    StressTest(String),
    #[error("query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TpcdsError {
    /// Wrap a failure raised while loading the dataset.
    pub fn load_failed(cause: TpcdsError) -> Self {
        TpcdsError::DataLoad {
            message: format!("Load failed: {cause}"),
            source: Box::new(cause),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TpcdsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenient alias for results returned by the stress tooling.
pub type Result<T> = std::result::Result<T, TpcdsError>;

/// File system locations used by the loader and the runner.
#[derive(Debug, Clone)]
pub struct StressPaths {
    /// Working directory of the preparation script; `tmp_stress/` lives here.
    pub root: PathBuf,
    /// Script that fetches and builds the TPC-DS kit and generates the data.
    pub prepare_script: PathBuf,
    /// SQL file with the `CREATE TABLE` statements.
    pub schema_sql: PathBuf,
    /// Directory `dsdgen` writes its raw `.dat` files into.
    pub generated_dir: PathBuf,
    /// Directory holding the cleaned copies that are fed to `COPY`.
    pub tables_dir: PathBuf,
    /// Directory of query files, one TPC-DS query per file.
    pub queries_dir: PathBuf,
}

impl StressPaths {
    /// Construct the default layout rooted at the provided directory.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let stress_root = root.join(STRESS_ROOT);
        let tools = stress_root.join(TPCDS_TOOLS_DIR);
        Self {
            root: root.to_path_buf(),
            prepare_script: root.join(PREPARE_SCRIPT),
            schema_sql: tools.join(TPCDS_SCHEMA_FILE),
            tables_dir: tools.join(PREPARED_TABLES_DIR),
            generated_dir: tools,
            queries_dir: stress_root.join(QUERY_QUALIFICATION_DIR),
        }
    }

    /// Path of the prepared data file for `file_name`.
    pub fn table_file(&self, file_name: &str) -> PathBuf {
        self.tables_dir.join(file_name)
    }
}

impl Default for StressPaths {
    fn default() -> Self {
        Self::from_root(".")
    }
}

pub(crate) fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| TpcdsError::io(path, source))
}
