use std::sync::Once;

static INIT: Once = Once::new();

/// Environment variable holding the libpq-style DSN for live PostgreSQL tests.
pub const LIVE_DSN_ENV: &str = "PGQS_TEST_DSN";

/// Initialize tracing for test binaries. Safe to call multiple times.
pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        let env = std::env::var("RUST_LOG").ok();
        let filter = match env {
            Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            None => EnvFilter::new("info"),
        };
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

/// Return the DSN of a server with `pg_query_state` installed, if one was provided.
///
/// Live tests call this first and return early when it yields `None`, so the
/// suite stays green on machines without a patched PostgreSQL.
pub fn live_dsn() -> Option<String> {
    parse_dsn(std::env::var(LIVE_DSN_ENV).ok())
}

fn parse_dsn(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(feature = "auto-init")]
mod auto {
    // Use ctor to run at binary init time to avoid having to call init in every test.
    use ctor::ctor;

    #[ctor]
    fn init() {
        super::init_tracing_for_tests();
    }
}
