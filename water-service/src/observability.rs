use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "water_service=info,water_client=info";

/// Installs the global fmt subscriber. `RUST_LOG` replaces the default
/// directives; calling this twice leaves the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
