//! Calls into the `pg_query_state` extension.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio_postgres::Row;

use crate::connection::{ConnectionConfig, Notice, PgConnection};
use crate::{Result, TpcdsError};

/// INFO message emitted when the inspected backend is running a statement.
pub const BACKEND_IS_ACTIVE_INFO: &str = "state of backend is active";
/// INFO message emitted when the inspected backend has nothing running.
pub const BACKEND_IS_IDLE_INFO: &str = "state of backend is idle";

const PG_QUERY_STATE_SQL: &str = "SELECT pid, frame_number, query_text, plan, leader_pid \
     FROM pg_query_state($1, $2, $3, $4, $5, $6, $7)";

/// Output format of the plan column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStateFormat {
    #[default]
    Text,
    Xml,
    Json,
    Yaml,
}

impl QueryStateFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStateFormat::Text => "text",
            QueryStateFormat::Xml => "xml",
            QueryStateFormat::Json => "json",
            QueryStateFormat::Yaml => "yaml",
        }
    }
}

impl fmt::Display for QueryStateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryStateFormat {
    type Err = TpcdsError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(QueryStateFormat::Text),
            "xml" => Ok(QueryStateFormat::Xml),
            "json" => Ok(QueryStateFormat::Json),
            "yaml" => Ok(QueryStateFormat::Yaml),
            other => Err(TpcdsError::Parse(format!(
                "plan format '{other}' (expected text, xml, json or yaml)"
            ))),
        }
    }
}

/// Arguments forwarded to `pg_query_state` after the backend pid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStateOptions {
    pub verbose: bool,
    pub costs: bool,
    pub timing: bool,
    pub buffers: bool,
    pub triggers: bool,
    pub format: QueryStateFormat,
}

/// One frame of the state reported for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStateRow {
    pub pid: i32,
    pub frame_number: i32,
    pub query_text: Option<String>,
    pub plan: Option<String>,
    pub leader_pid: Option<i32>,
}

impl QueryStateRow {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            pid: row.try_get("pid")?,
            frame_number: row.try_get("frame_number")?,
            query_text: row.try_get("query_text")?,
            plan: row.try_get("plan")?,
            leader_pid: row.try_get("leader_pid")?,
        })
    }
}

/// Rows and notices produced by one diagnostic call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    pub rows: Vec<QueryStateRow>,
    pub notices: Vec<Notice>,
}

impl PollResult {
    pub fn new(rows: Vec<QueryStateRow>, notices: Vec<Notice>) -> Self {
        Self { rows, notices }
    }

    /// A poll with neither rows nor notices.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn backend_active() -> Self {
        Self::new(Vec::new(), vec![Notice::info(BACKEND_IS_ACTIVE_INFO)])
    }

    pub fn backend_idle() -> Self {
        Self::new(Vec::new(), vec![Notice::info(BACKEND_IS_IDLE_INFO)])
    }

    pub fn has_state(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn reports_active(&self) -> bool {
        self.notices.iter().any(|n| n.is_info(BACKEND_IS_ACTIVE_INFO))
    }

    pub fn reports_idle(&self) -> bool {
        self.notices.iter().any(|n| n.is_info(BACKEND_IS_IDLE_INFO))
    }
}

/// One diagnostic request against a backend.
#[async_trait]
pub trait QueryStateProbe: Send + Sync {
    async fn poll(&self, pid: i32) -> Result<PollResult>;
}

/// Probe that opens a short-lived connection for every call.
///
/// A fresh connection per call keeps the probing backend independent of the
/// one being probed, and mirrors how an operator would inspect a stuck query.
#[derive(Debug, Clone)]
pub struct PgQueryStateProbe {
    config: ConnectionConfig,
    options: QueryStateOptions,
}

impl PgQueryStateProbe {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_options(config, QueryStateOptions::default())
    }

    pub fn with_options(config: ConnectionConfig, options: QueryStateOptions) -> Self {
        Self { config, options }
    }

    pub fn options(&self) -> &QueryStateOptions {
        &self.options
    }
}

#[async_trait]
impl QueryStateProbe for PgQueryStateProbe {
    async fn poll(&self, pid: i32) -> Result<PollResult> {
        let conn = PgConnection::open_recording_notices(&self.config).await?;
        let opts = &self.options;
        let format = opts.format.as_str();
        let queried = conn
            .client()
            .query(
                PG_QUERY_STATE_SQL,
                &[
                    &pid,
                    &opts.verbose,
                    &opts.costs,
                    &opts.timing,
                    &opts.buffers,
                    &opts.triggers,
                    &format,
                ],
            )
            .await;
        let notices = conn.take_notices();
        conn.close().await;

        let rows = queried?
            .iter()
            .map(QueryStateRow::from_row)
            .collect::<Result<Vec<_>>>()?;
        tracing::trace!(
            target: "tpcds-stress",
            pid,
            rows = rows.len(),
            notices = notices.len(),
            "pg_query_state polled"
        );
        Ok(PollResult { rows, notices })
    }
}
