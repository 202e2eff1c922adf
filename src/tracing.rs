use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter for the sync binary when neither `CATALOG_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info,catalog_sync=info,sqlx=warn";

/// `CATALOG_LOG` wins over `RUST_LOG` so the sync job can be tuned without touching
/// other processes sharing the environment.
fn resolve_filter(default_filter: &str) -> EnvFilter {
    filter_from(
        std::env::var("CATALOG_LOG").ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        default_filter,
    )
}

/// Unparseable directives fall through to the next source.
fn filter_from(
    catalog_log: Option<String>,
    rust_log: Option<String>,
    default_filter: &str,
) -> EnvFilter {
    catalog_log
        .into_iter()
        .chain(rust_log)
        .find_map(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}

/// Install the global fmt subscriber (targets, files and line numbers on).
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    SubscriberBuilder::default()
        .with_env_filter(resolve_filter(default_filter))
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
