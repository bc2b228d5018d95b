use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, subscriber::set_global_default};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

use petrel::config::{context::build_context, schema::load_config};
use petrel::frontend::http::run_server;

const DEFAULT_LOG_FILTER: &str = "petrel=info";

#[derive(Debug, Parser)]
#[clap(
    name = "petrel",
    version,
    about = "Authenticated REST and realtime records API over a relational database"
)]
struct Args {
    /// Path to the TOML config file
    #[clap(short, long, default_value = "petrel.toml")]
    config_path: PathBuf,

    /// Emit logs as JSON lines
    #[clap(long)]
    json_logs: bool,
}

fn prepare_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if json_logs {
        set_global_default(builder.json().finish())
    } else {
        set_global_default(builder.finish())
    };
    if let Err(e) = result {
        eprintln!("Failed to install the tracing subscriber: {e}");
    }

    // sqlx logs through the `log` crate
    if let Err(e) = LogTracer::init() {
        eprintln!("Failed to forward log records to tracing: {e}");
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    info!("Starting petrel {}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading the config from {:?}: {e}", args.config_path);
            exit(1);
        }
    };

    let Some(http) = config.frontend.http.clone() else {
        error!("No frontend configured, nothing to do");
        exit(1);
    };
    let sweep_interval = Duration::from_millis(config.realtime.sweep_interval_ms);

    let context = match build_context(config).await {
        Ok(context) => context,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let sweeper = context
        .engine
        .bus()
        .spawn_sweeper(sweep_interval, shutdown.clone());

    tokio::select! {
        result = run_server(context, http) => {
            if let Err(e) = result {
                error!("Error parsing the listen address: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    shutdown.cancel();
    let _ = sweeper.await;
}
