//! In-memory stand-ins for a PostgreSQL backend running `pg_query_state`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pgqs_tpcds::{
    Notice, PollResult, QueryOutcome, QueryStateProbe, QueryStateRow, Result, StressSession,
    TpcdsError,
};

pub const FAKE_PID: i32 = 4242;
/// Simulated execution time consumed by one probe call.
pub const TICK_MS: u64 = 100;

#[derive(Debug)]
struct Running {
    sql: String,
    remaining_ms: u64,
    outcome: Result<QueryOutcomeKind>,
}

#[derive(Debug, Clone, Copy)]
enum QueryOutcomeKind {
    Completed,
    Cancelled,
}

/// Behavior of a statement on the fake server.
#[derive(Debug, Clone)]
pub enum FakeQuery {
    /// Runs for the given number of milliseconds.
    Runs(u64),
    /// Fails with a non-timeout error.
    Fails(String),
}

#[derive(Debug, Default)]
struct ServerState {
    statement_timeout_ms: u64,
    behavior: HashMap<String, FakeQuery>,
    running: Option<Running>,
    timeouts_set: Vec<u64>,
    dispatched: Vec<String>,
    polled_pids: Vec<i32>,
    overlapping_dispatches: usize,
    closed: bool,
}

/// Shared state behind [`FakeSession`] and [`FakeProbe`].
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(self, sql: &str, behavior: FakeQuery) -> Self {
        self.state
            .lock()
            .unwrap()
            .behavior
            .insert(sql.to_string(), behavior);
        self
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
        }
    }

    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            server: self.clone(),
        }
    }

    pub fn timeouts_set(&self) -> Vec<u64> {
        self.state.lock().unwrap().timeouts_set.clone()
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.state.lock().unwrap().dispatched.clone()
    }

    pub fn polled_pids(&self) -> Vec<i32> {
        self.state.lock().unwrap().polled_pids.clone()
    }

    /// Dispatches issued while an earlier statement was still unawaited.
    pub fn overlapping_dispatches(&self) -> usize {
        self.state.lock().unwrap().overlapping_dispatches
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

pub struct FakeSession {
    server: FakeServer,
}

#[async_trait]
impl StressSession for FakeSession {
    fn backend_pid(&self) -> i32 {
        FAKE_PID
    }

    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        state.statement_timeout_ms = timeout_ms;
        state.timeouts_set.push(timeout_ms);
        Ok(())
    }

    async fn dispatch(&mut self, sql: &str) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        let behavior = state
            .behavior
            .get(sql)
            .cloned()
            .unwrap_or(FakeQuery::Runs(0));
        let timeout = state.statement_timeout_ms;
        let running = match behavior {
            FakeQuery::Runs(ms) if timeout > 0 && ms > timeout => Running {
                sql: sql.to_string(),
                remaining_ms: timeout,
                outcome: Ok(QueryOutcomeKind::Cancelled),
            },
            FakeQuery::Runs(ms) => Running {
                sql: sql.to_string(),
                remaining_ms: ms,
                outcome: Ok(QueryOutcomeKind::Completed),
            },
            FakeQuery::Fails(message) => Running {
                sql: sql.to_string(),
                remaining_ms: 0,
                outcome: Err(TpcdsError::StressTest(message)),
            },
        };
        if state.running.is_some() {
            state.overlapping_dispatches += 1;
        }
        state.dispatched.push(sql.to_string());
        state.running = Some(running);
        Ok(())
    }

    async fn wait(&mut self) -> Result<QueryOutcome> {
        let mut state = self.server.state.lock().unwrap();
        match state.running.take() {
            None => Ok(QueryOutcome::Completed),
            Some(running) => match running.outcome? {
                QueryOutcomeKind::Completed => Ok(QueryOutcome::Completed),
                QueryOutcomeKind::Cancelled => Ok(QueryOutcome::Cancelled),
            },
        }
    }

    async fn close(self) -> Result<()> {
        self.server.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Reports the fake backend as active while it has simulated work left.
pub struct FakeProbe {
    server: FakeServer,
}

#[async_trait]
impl QueryStateProbe for FakeProbe {
    async fn poll(&self, pid: i32) -> Result<PollResult> {
        let mut state = self.server.state.lock().unwrap();
        state.polled_pids.push(pid);
        let Some(running) = state.running.as_mut() else {
            return Ok(PollResult::backend_idle());
        };
        if running.remaining_ms == 0 {
            return Ok(PollResult::backend_idle());
        }
        running.remaining_ms = running.remaining_ms.saturating_sub(TICK_MS);
        let row = QueryStateRow {
            pid,
            frame_number: 0,
            query_text: Some(running.sql.clone()),
            plan: Some("Result".to_string()),
            leader_pid: None,
        };
        Ok(PollResult::new(
            vec![row],
            vec![Notice::info(pgqs_tpcds::probe::BACKEND_IS_ACTIVE_INFO)],
        ))
    }
}

/// Probe that replays a fixed script and then repeats its fallback forever.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<PollResult>>>,
    fallback: PollResult,
    calls: Mutex<usize>,
}

impl ScriptedProbe {
    pub fn new(script: Vec<Result<PollResult>>, fallback: PollResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(0),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new(), PollResult::empty())
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl QueryStateProbe for ScriptedProbe {
    async fn poll(&self, _pid: i32) -> Result<PollResult> {
        *self.calls.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}
