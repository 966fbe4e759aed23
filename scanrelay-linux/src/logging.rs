//! Logging initialization: `tracing-subscriber` fmt layer filtered by `EnvFilter`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level: `RUST_LOG`, else `SCANRELAY_LOG_LEVEL`, else `info`. `verbose` forces `debug`.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let env_filter = if verbose {
        EnvFilter::try_new("debug")?
    } else {
        let log_level =
            std::env::var("SCANRELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?
    };

    // No ANSI colors for journald.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}
