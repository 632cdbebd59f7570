use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pgqs_tpcds::stress::{
    BEFORE_GETTING_QS_DELAY, DEFAULT_STATEMENT_TIMEOUT_MS, MAX_FIRST_GETTING_QS_RETRIES,
    PG_QS_DELAY,
};
use pgqs_tpcds::{
    ConnectionConfig, ExcludeList, LoadSummary, PollPolicy, QueryStateFormat, QueryStateOptions,
    RunOptions, StressEvent, StressPaths, StressReport, TableLoadEvent, TpcdsError, run_tpcds,
    setup_tpcds, verify_row_counts,
};

const PROGRESS_BAR_WIDTH: usize = 40;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber to respect RUST_LOG environment variable
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        tracing::error!("tpcds stress run failed: {err}");
        eprintln!("error: {err}");
        process::exit(1);
    }
}

#[derive(Parser)]
#[command(
    name = "pgqs-tpcds",
    about = "Load TPC-DS into PostgreSQL and stress pg_query_state with its query set"
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the preparation script, create the schema and load every table.
    Setup(SetupArgs),
    /// Replay the query set while polling pg_query_state on the busy backend.
    Run(RunArgs),
    /// Setup followed by run.
    All(AllArgs),
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    #[arg(long, env = "PGHOST", default_value = "localhost", global = true)]
    host: String,
    #[arg(long, env = "PGPORT", default_value_t = 5432, global = true)]
    port: u16,
    #[arg(long, env = "PGUSER", default_value = "postgres", global = true)]
    user: String,
    #[arg(long, env = "PGPASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
    #[arg(long, env = "PGDATABASE", default_value = "postgres", global = true)]
    dbname: String,
}

impl ConnectionArgs {
    fn config(&self) -> ConnectionConfig {
        let config = ConnectionConfig::new(&self.host, self.port, &self.user, &self.dbname);
        match &self.password {
            Some(password) => config.with_password(password),
            None => config,
        }
    }
}

#[derive(Args, Clone)]
struct PathArgs {
    /// Directory the `tests/` script and `tmp_stress/` layout are resolved against.
    #[arg(long, value_name = "DIR", default_value = ".")]
    root: PathBuf,
    /// Override the directory of query files.
    #[arg(long, value_name = "DIR")]
    queries_dir: Option<PathBuf>,
}

impl PathArgs {
    fn paths(&self) -> StressPaths {
        let mut paths = StressPaths::from_root(&self.root);
        if let Some(dir) = &self.queries_dir {
            paths.queries_dir = dir.clone();
        }
        paths
    }
}

#[derive(Args, Clone)]
struct SetupArgs {
    #[command(flatten)]
    paths: PathArgs,
    /// Compare each table's row count with its data file after loading.
    #[arg(long)]
    verify: bool,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    paths: PathArgs,
    #[command(flatten)]
    stress: StressArgs,
}

#[derive(Args, Clone)]
struct AllArgs {
    #[command(flatten)]
    paths: PathArgs,
    #[arg(long)]
    verify: bool,
    #[command(flatten)]
    stress: StressArgs,
}

#[derive(Args, Clone)]
struct StressArgs {
    /// statement_timeout applied before every query, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_STATEMENT_TIMEOUT_MS)]
    statement_timeout: u64,
    /// 1-based query numbers to skip, e.g. --exclude 14,23.
    #[arg(long, value_name = "N,..", value_parser = parse_exclude_list)]
    exclude: Option<ExcludeList>,
    /// Empty polls tolerated before a query is assumed finished.
    #[arg(long, value_name = "N", default_value_t = MAX_FIRST_GETTING_QS_RETRIES)]
    max_first_retries: u32,
    #[arg(long, value_name = "MS", default_value_t = BEFORE_GETTING_QS_DELAY.as_millis() as u64)]
    before_delay_ms: u64,
    #[arg(long, value_name = "MS", default_value_t = PG_QS_DELAY.as_millis() as u64)]
    poll_delay_ms: u64,
    /// Fail when a backend stays active longer than this while being polled.
    #[arg(long, value_name = "SECS")]
    hang_timeout_secs: Option<u64>,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    costs: bool,
    #[arg(long)]
    timing: bool,
    #[arg(long)]
    buffers: bool,
    #[arg(long)]
    triggers: bool,
    /// Plan format requested from pg_query_state.
    #[arg(long, value_name = "FORMAT", default_value = "text", value_parser = parse_format)]
    format: QueryStateFormat,
}

impl StressArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            statement_timeout_ms: self.statement_timeout,
            exclude: self.exclude.clone().unwrap_or_default(),
            poll: PollPolicy {
                max_first_retries: self.max_first_retries,
                before_delay: Duration::from_millis(self.before_delay_ms),
                poll_delay: Duration::from_millis(self.poll_delay_ms),
                hang_timeout: self.hang_timeout_secs.map(Duration::from_secs),
            },
            query_state: QueryStateOptions {
                verbose: self.verbose,
                costs: self.costs,
                timing: self.timing,
                buffers: self.buffers,
                triggers: self.triggers,
                format: self.format,
            },
        }
    }
}

fn parse_exclude_list(value: &str) -> Result<ExcludeList, String> {
    value.parse().map_err(|err: TpcdsError| err.to_string())
}

fn parse_format(value: &str) -> Result<QueryStateFormat, String> {
    value.parse().map_err(|err: TpcdsError| err.to_string())
}

async fn run() -> Result<(), TpcdsError> {
    let cli = Cli::parse();
    let config = cli.connection.config();
    match cli.command {
        Command::Setup(args) => run_setup(&config, &args.paths.paths(), args.verify).await,
        Command::Run(args) => run_stress(&config, &args.paths.paths(), &args.stress).await,
        Command::All(args) => {
            let paths = args.paths.paths();
            run_setup(&config, &paths, args.verify).await?;
            run_stress(&config, &paths, &args.stress).await
        }
    }
}

async fn run_setup(
    config: &ConnectionConfig,
    paths: &StressPaths,
    verify: bool,
) -> Result<(), TpcdsError> {
    let summary = setup_tpcds(config, paths, |event| {
        if let TableLoadEvent::Complete {
            table,
            rows,
            elapsed,
        } = event
        {
            println!(
                "     finished {table} ({rows} rows) in {:.2}s",
                elapsed.as_secs_f64()
            );
        }
    })
    .await?;
    print_load_summary(&summary);

    if verify {
        let mismatches = verify_row_counts(config, paths, &summary).await?;
        if mismatches.is_empty() {
            println!("Row counts match their data files.");
        } else {
            for mismatch in &mismatches {
                println!(
                    "  ! {:<24} expected {:>10} rows, found {:>10}",
                    mismatch.table, mismatch.expected, mismatch.actual
                );
            }
            return Err(TpcdsError::Verification(format!(
                "{} tables have unexpected row counts",
                mismatches.len()
            )));
        }
    }
    Ok(())
}

async fn run_stress(
    config: &ConnectionConfig,
    paths: &StressPaths,
    args: &StressArgs,
) -> Result<(), TpcdsError> {
    let mut progress = ProgressBar::new(io::stdout());
    let result = run_tpcds(config, paths, args.options(), |event| match event {
        StressEvent::Started { total, pid } => {
            tracing::info!(target: "tpcds-stress", total, pid, "stress run started");
            progress.total = total;
        }
        StressEvent::QueryStarted { index, .. } => progress.update(index),
        StressEvent::QuerySkipped { index } => {
            tracing::debug!(target: "tpcds-stress", query = index, "query excluded");
        }
        StressEvent::QueryFinished { .. } => {}
        StressEvent::Finished => progress.finish(),
    })
    .await;
    // Errors skip the `Finished` event; end the bar line before reporting them.
    progress.finish();
    print_stress_summary(&result?);
    Ok(())
}

struct ProgressBar<W: Write> {
    out: W,
    total: usize,
    line_open: bool,
}

impl<W: Write> ProgressBar<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            total: 0,
            line_open: false,
        }
    }

    fn update(&mut self, done: usize) {
        let filled = if self.total == 0 {
            PROGRESS_BAR_WIDTH
        } else {
            done.min(self.total) * PROGRESS_BAR_WIDTH / self.total
        };
        let _ = write!(
            self.out,
            "\r[{}{}] {done}/{}",
            "#".repeat(filled),
            " ".repeat(PROGRESS_BAR_WIDTH - filled),
            self.total
        );
        let _ = self.out.flush();
        self.line_open = true;
    }

    fn finish(&mut self) {
        if self.line_open {
            let _ = writeln!(self.out);
            self.line_open = false;
        }
    }
}

fn print_load_summary(summary: &LoadSummary) {
    println!(
        "\nLoaded {} rows across {} tables:",
        summary.total_rows(),
        summary.tables.len()
    );
    for entry in &summary.tables {
        println!("  - {:<24} {:>10} rows", entry.table, entry.rows);
    }
}

fn print_stress_summary(report: &StressReport) {
    println!(
        "\nExecuted {} of {} queries ({} completed, {} timed out, {} excluded)",
        report.executed(),
        report.total,
        report.completed.len(),
        report.timeouts.len(),
        report.excluded.len()
    );
}
