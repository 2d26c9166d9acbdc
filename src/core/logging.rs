use tracing::metadata::LevelFilter;

pub const ENV_LOG: &str = "MODEL_CACHE_LOG";

/// Installs the global fmt subscriber. The level comes from
/// `$MODEL_CACHE_LOG` and defaults to `INFO`; a second call is a no-op.
pub fn init() {
    let filter = std::env::var(ENV_LOG)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}
