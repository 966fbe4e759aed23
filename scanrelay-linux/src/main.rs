// Scan relay for Linux: local line listener, TLS uplink to the collector, spillover cache.

mod config;
mod indicator;
mod listener;
mod logging;
mod runtime;
mod tls;
mod uplink;
mod uptime;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Configuration could not be loaded (sysexits EX_CONFIG).
const EXIT_CONFIG: u8 = 78;

#[derive(Debug, Parser)]
#[command(name = "scanrelay", version, about = "Relay scanner telemetry to a collector")]
struct Cli {
    /// Config file (default: ~/.config/scanrelay/config.toml, then /etc/scanrelay/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("scanrelay: cannot initialise logging: {e}");
    }

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server_host,
        port = cfg.server_port,
        local_port = cfg.local_port,
        "starting scanrelay"
    );

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(runtime::run(cfg)) {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
