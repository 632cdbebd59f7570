//! The stress runner.
//!
//! Every query of the workload is dispatched on one long-lived session while a
//! [`QueryStateProbe`] keeps asking `pg_query_state` for the state of that
//! session's backend. Polling follows a two-state machine:
//!
//! * **before state**: poll until the backend shows a plan or reports itself
//!   active. A bounded number of empty polls means the query most likely
//!   finished before we caught it.
//! * **getting state**: keep polling until the backend reports itself idle.
//!
//! Statement timeouts are expected and recorded. Everything else aborts the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_postgres::Client;
use tokio_postgres::error::SqlState;

use crate::connection::{ConnectionConfig, PgConnection};
use crate::probe::{PgQueryStateProbe, QueryStateOptions, QueryStateProbe};
use crate::queries::{ExcludeList, QuerySet, load_query_set};
use crate::{Result, StressPaths, TpcdsError};

pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 20_000;
pub const MAX_FIRST_GETTING_QS_RETRIES: u32 = 10;
pub const BEFORE_GETTING_QS_DELAY: Duration = Duration::from_millis(100);
pub const PG_QS_DELAY: Duration = Duration::from_millis(100);

/// How a dispatched query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed,
    /// Cancelled by the server, typically because `statement_timeout` fired.
    Cancelled,
}

/// The connection the workload runs on.
#[async_trait]
pub trait StressSession: Send {
    /// Process id of the server backend serving this session.
    fn backend_pid(&self) -> i32;

    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<()>;

    /// Start `sql` without waiting for it to finish. Every dispatch is
    /// followed by [`StressSession::wait`] before the next one.
    async fn dispatch(&mut self, sql: &str) -> Result<()>;

    /// Wait for the dispatched statement to finish.
    async fn wait(&mut self) -> Result<QueryOutcome>;

    async fn close(self) -> Result<()>;
}

/// Session backed by a real PostgreSQL connection.
pub struct PgStressSession {
    conn: PgConnection,
    pid: i32,
    in_flight: Option<JoinHandle<std::result::Result<(), tokio_postgres::Error>>>,
}

impl PgStressSession {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = PgConnection::open(config).await?;
        let pid = match conn.backend_pid().await {
            Ok(pid) => pid,
            Err(err) => {
                conn.close().await;
                return Err(err);
            }
        };
        tracing::debug!(target: "tpcds-stress", pid, "stress session connected");
        Ok(Self {
            conn,
            pid,
            in_flight: None,
        })
    }

    fn client(&self) -> Arc<Client> {
        self.conn.shared_client()
    }
}

#[async_trait]
impl StressSession for PgStressSession {
    fn backend_pid(&self) -> i32 {
        self.pid
    }

    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<()> {
        let sql = format!("SET statement_timeout TO {timeout_ms}");
        Ok(self.conn.client().batch_execute(&sql).await?)
    }

    async fn dispatch(&mut self, sql: &str) -> Result<()> {
        debug_assert!(self.in_flight.is_none(), "dispatch without wait");
        let client = self.client();
        let sql = sql.to_owned();
        self.in_flight = Some(tokio::spawn(async move { client.batch_execute(&sql).await }));
        Ok(())
    }

    async fn wait(&mut self) -> Result<QueryOutcome> {
        let Some(handle) = self.in_flight.take() else {
            return Ok(QueryOutcome::Completed);
        };
        match handle.await? {
            Ok(()) => Ok(QueryOutcome::Completed),
            Err(err) if err.code() == Some(&SqlState::QUERY_CANCELED) => {
                Ok(QueryOutcome::Cancelled)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn close(self) -> Result<()> {
        if let Some(handle) = &self.in_flight {
            handle.abort();
        }
        self.conn.close().await;
        Ok(())
    }
}

/// Retry budget and delays of the polling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Empty polls tolerated before the query is assumed to be finished.
    pub max_first_retries: u32,
    pub before_delay: Duration,
    pub poll_delay: Duration,
    /// Fail the run when the backend stays active longer than this.
    pub hang_timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_first_retries: MAX_FIRST_GETTING_QS_RETRIES,
            before_delay: BEFORE_GETTING_QS_DELAY,
            poll_delay: PG_QS_DELAY,
            hang_timeout: None,
        }
    }
}

/// What the polling loop saw for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// No state ever showed up; the query likely finished before the first poll.
    AssumedCompleted { polls: u32 },
    /// State was captured and the backend later reported itself idle.
    BackendIdle { polls: u32 },
    /// The backend stayed active past the policy's hang timeout.
    Hung { polls: u32, elapsed: Duration },
}

impl Observation {
    pub fn polls(&self) -> u32 {
        match *self {
            Observation::AssumedCompleted { polls }
            | Observation::BackendIdle { polls }
            | Observation::Hung { polls, .. } => polls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    BeforeGettingQs,
    GettingQs,
}

/// Poll `pid` until the running statement has been observed and has finished.
///
/// Terminates after `max_first_retries` empty polls when the backend never
/// shows any state.
pub async fn observe_query_state<P>(
    probe: &P,
    pid: i32,
    policy: &PollPolicy,
) -> Result<Observation>
where
    P: QueryStateProbe + ?Sized,
{
    let mut state = PollState::BeforeGettingQs;
    let mut empty_polls = 0u32;
    let mut polls = 0u32;
    let mut active_since = None;

    loop {
        let result = probe.poll(pid).await?;
        polls += 1;
        match state {
            PollState::BeforeGettingQs => {
                if result.has_state() || result.reports_active() {
                    state = PollState::GettingQs;
                    active_since = Some(Instant::now());
                    continue;
                }
                empty_polls += 1;
                if empty_polls >= policy.max_first_retries {
                    return Ok(Observation::AssumedCompleted { polls });
                }
                sleep(policy.before_delay).await;
            }
            PollState::GettingQs => {
                if result.reports_idle() {
                    return Ok(Observation::BackendIdle { polls });
                }
                if let (Some(limit), Some(since)) = (policy.hang_timeout, active_since) {
                    let elapsed = since.elapsed();
                    if elapsed >= limit {
                        return Ok(Observation::Hung { polls, elapsed });
                    }
                }
                sleep(policy.poll_delay).await;
            }
        }
    }
}

/// Knobs of a stress run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub statement_timeout_ms: u64,
    pub exclude: ExcludeList,
    pub poll: PollPolicy,
    pub query_state: QueryStateOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            exclude: ExcludeList::default(),
            poll: PollPolicy::default(),
            query_state: QueryStateOptions::default(),
        }
    }
}

/// Progress notifications emitted by [`StressRunner::run`].
#[derive(Debug, Clone, Copy)]
pub enum StressEvent {
    Started { total: usize, pid: i32 },
    QueryStarted { index: usize, total: usize },
    QuerySkipped { index: usize },
    QueryFinished {
        index: usize,
        outcome: QueryOutcome,
        observation: Observation,
    },
    Finished,
}

/// Result of a stress run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StressReport {
    pub total: usize,
    pub statement_timeout_ms: u64,
    pub excluded: Vec<usize>,
    pub completed: Vec<usize>,
    /// 1-based indices of queries cancelled by the statement timeout.
    pub timeouts: Vec<usize>,
}

impl StressReport {
    pub fn executed(&self) -> usize {
        self.completed.len() + self.timeouts.len()
    }
}

/// Drives a query set through a session while probing it.
pub struct StressRunner<P> {
    probe: P,
    options: RunOptions,
}

impl<P: QueryStateProbe> StressRunner<P> {
    pub fn new(probe: P, options: RunOptions) -> Self {
        Self { probe, options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every non-excluded query of `queries` on `session`.
    ///
    /// The session is closed on every exit path.
    pub async fn run<S, F>(
        &self,
        mut session: S,
        queries: &QuerySet,
        mut on_event: F,
    ) -> Result<StressReport>
    where
        S: StressSession,
        F: FnMut(StressEvent),
    {
        let ran = self.run_queries(&mut session, queries, &mut on_event).await;
        let closed = session.close().await;
        let report = ran?;
        closed?;
        on_event(StressEvent::Finished);
        Ok(report)
    }

    async fn run_queries<S, F>(
        &self,
        session: &mut S,
        queries: &QuerySet,
        on_event: &mut F,
    ) -> Result<StressReport>
    where
        S: StressSession,
        F: FnMut(StressEvent),
    {
        let pid = session.backend_pid();
        let total = queries.len();
        let mut report = StressReport {
            total,
            statement_timeout_ms: self.options.statement_timeout_ms,
            ..StressReport::default()
        };
        on_event(StressEvent::Started { total, pid });

        for query in queries {
            let index = query.index;
            on_event(StressEvent::QueryStarted { index, total });
            if self.options.exclude.contains(index) {
                report.excluded.push(index);
                on_event(StressEvent::QuerySkipped { index });
                continue;
            }

            session
                .set_statement_timeout(self.options.statement_timeout_ms)
                .await?;
            session.dispatch(&query.sql).await?;

            let observation = observe_query_state(&self.probe, pid, &self.options.poll).await?;
            if let Observation::Hung { elapsed, .. } = observation {
                return Err(TpcdsError::StressTest(format!(
                    "query {index} still active after {:.1}s of polling",
                    elapsed.as_secs_f64()
                )));
            }

            let outcome = session.wait().await?;
            match outcome {
                QueryOutcome::Completed => report.completed.push(index),
                QueryOutcome::Cancelled => {
                    tracing::info!(
                        target: "tpcds-stress",
                        query = index,
                        timeout_ms = self.options.statement_timeout_ms,
                        "query cancelled by statement timeout"
                    );
                    report.timeouts.push(index);
                }
            }
            tracing::debug!(
                target: "tpcds-stress",
                query = index,
                ?outcome,
                polls = observation.polls(),
                "query finished"
            );
            on_event(StressEvent::QueryFinished {
                index,
                outcome,
                observation,
            });
        }

        Ok(report)
    }
}

/// Run the TPC-DS query set against the server described by `config`.
pub async fn run_tpcds<F>(
    config: &ConnectionConfig,
    paths: &StressPaths,
    options: RunOptions,
    on_event: F,
) -> Result<StressReport>
where
    F: FnMut(StressEvent),
{
    println!("Preparing TPC-DS queries...");
    let queries = load_query_set(&paths.queries_dir)?;

    let session = PgStressSession::connect(config).await?;
    let probe = PgQueryStateProbe::with_options(config.clone(), options.query_state);
    let runner = StressRunner::new(probe, options);

    println!("Starting TPC-DS queries...");
    let report = runner.run(session, &queries, on_event).await?;

    if !report.timeouts.is_empty() {
        println!(
            "\nThere were pg_query_state timeouts ({} s) on queries: {:?}",
            report.statement_timeout_ms as f64 / 1000.0,
            report.timeouts
        );
    }
    Ok(report)
}
