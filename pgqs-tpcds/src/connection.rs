//! Connection handling shared by the loader, the stress session and the probe.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

use crate::{Result, TpcdsError};

const APPLICATION_NAME: &str = "pgqs-tpcds";

/// Connection settings for the target server.
///
/// Thin wrapper over [`tokio_postgres::Config`] so callers can build it either
/// field by field or from a libpq-style connection string.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    inner: tokio_postgres::Config,
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u16, user: &str, dbname: &str) -> Self {
        let mut inner = tokio_postgres::Config::new();
        inner
            .host(host)
            .port(port)
            .user(user)
            .dbname(dbname)
            .application_name(APPLICATION_NAME);
        Self { inner }
    }

    pub fn with_password(mut self, password: impl AsRef<[u8]>) -> Self {
        self.inner.password(password);
        self
    }

    pub fn pg_config(&self) -> &tokio_postgres::Config {
        &self.inner
    }
}

impl FromStr for ConnectionConfig {
    type Err = TpcdsError;

    fn from_str(dsn: &str) -> Result<Self> {
        let mut inner = tokio_postgres::Config::from_str(dsn)?;
        if inner.get_application_name().is_none() {
            inner.application_name(APPLICATION_NAME);
        }
        Ok(Self { inner })
    }
}

impl From<tokio_postgres::Config> for ConnectionConfig {
    fn from(inner: tokio_postgres::Config) -> Self {
        Self { inner }
    }
}

/// A notice the server sent outside of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: String,
    pub message: String,
}

impl Notice {
    pub fn new(severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: severity.into(),
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new("INFO", message)
    }

    /// Return `true` when this notice carries exactly the given INFO message.
    pub fn is_info(&self, message: &str) -> bool {
        self.severity.eq_ignore_ascii_case("INFO") && self.message.trim_end() == message
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:  {}", self.severity, self.message)
    }
}

/// Notices handed over by a connection's driver task.
///
/// A discarding log only traces what it sees, so long-lived connections do not
/// accumulate notices nobody reads.
#[derive(Debug, Clone)]
struct NoticeLog {
    entries: Option<Arc<Mutex<Vec<Notice>>>>,
}

impl NoticeLog {
    fn recording() -> Self {
        Self {
            entries: Some(Arc::default()),
        }
    }

    fn discarding() -> Self {
        Self { entries: None }
    }

    fn record(&self, notice: Notice) {
        if let Some(entries) = &self.entries
            && let Ok(mut log) = entries.lock()
        {
            log.push(notice);
        }
    }

    fn take(&self) -> Vec<Notice> {
        match self.entries.as_ref().map(|entries| entries.lock()) {
            Some(Ok(mut log)) => std::mem::take(&mut *log),
            _ => Vec::new(),
        }
    }
}

/// An open client plus the task driving its socket.
///
/// Connections opened with [`PgConnection::open_recording_notices`] keep every
/// notice the server emits, which is how `pg_query_state` reports whether the
/// target backend is active or idle.
pub struct PgConnection {
    client: Arc<Client>,
    notices: NoticeLog,
    driver: JoinHandle<()>,
}

impl PgConnection {
    /// Open a connection whose notices are traced and dropped.
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        Self::connect(config, NoticeLog::discarding()).await
    }

    /// Open a connection that keeps its notices for [`PgConnection::take_notices`].
    pub async fn open_recording_notices(config: &ConnectionConfig) -> Result<Self> {
        Self::connect(config, NoticeLog::recording()).await
    }

    async fn connect(config: &ConnectionConfig, notices: NoticeLog) -> Result<Self> {
        let (client, mut connection) = config.pg_config().connect(NoTls).await?;
        let sink = notices.clone();

        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::trace!(
                            target: "tpcds-connection",
                            severity = notice.severity(),
                            "{}",
                            notice.message()
                        );
                        sink.record(Notice::new(notice.severity(), notice.message()));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "tpcds-connection", "connection error: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client: Arc::new(client),
            notices,
            driver,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shared handle for tasks that outlive a borrow of this connection.
    pub fn shared_client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    /// Drain the notices received so far. Always empty unless the connection
    /// was opened with [`PgConnection::open_recording_notices`].
    pub fn take_notices(&self) -> Vec<Notice> {
        self.notices.take()
    }

    pub async fn backend_pid(&self) -> Result<i32> {
        let row = self.client.query_one("SELECT pg_backend_pid()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    /// Close the connection and wait for the driver task to wind down.
    ///
    /// If another task still holds a shared client handle the socket cannot be
    /// closed gracefully, so the driver is aborted instead.
    pub async fn close(self) {
        let Self { client, driver, .. } = self;
        if Arc::strong_count(&client) > 1 {
            driver.abort();
        }
        drop(client);
        if let Err(err) = driver.await
            && !err.is_cancelled()
        {
            tracing::warn!(target: "tpcds-connection", "connection driver failed: {err}");
        }
    }
}
