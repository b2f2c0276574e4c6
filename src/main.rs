use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cruise::error::AppError;
use cruise::modules::config::{apply_env_overrides, default_db_path, get_data_dir, load_app_config};
use cruise::modules::infra::database::Ledger;
use cruise::modules::server;
use cruise::modules::state::AppState;

#[derive(Parser)]
#[command(name = "cruise")]
#[command(version)]
#[command(about = "Quota-aware transparent proxy for LLM Messages APIs")]
struct Cli {
    /// Port to listen on (default 4141)
    #[arg(long)]
    port: Option<u16>,

    /// Override the usage database path
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

fn init_tracing() {
    // Precedence: RUST_LOG env var > default "info"
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cruise=info,tower_http=info".into());

    let file_layer = get_data_dir().ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir.join("logs"), "cruise.log");
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing();

    // Configuration errors at startup are fatal
    let mut config = match load_app_config().map_err(AppError::Config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    apply_env_overrides(&mut config);
    if let Some(port) = cli.port {
        config.port = port;
    }

    let db_path = match cli.db_path {
        Some(path) => path,
        None => match default_db_path() {
            Ok(path) => path,
            Err(e) => {
                error!("Configuration error: {}", e);
                std::process::exit(1);
            }
        },
    };

    let ledger = match Ledger::open(&db_path) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("Failed to open usage ledger: {}", e);
            std::process::exit(1);
        }
    };

    // Drop out-of-retention rows on startup
    if let Err(e) = ledger.cleanup(config.retention_days) {
        error!("Retention cleanup failed: {}", e);
    }

    let port = config.port;
    let state = Arc::new(AppState::new(config, ledger.clone()));

    info!("cruise v{} starting", env!("CARGO_PKG_VERSION"));

    let result = server::serve(state, port).await;

    // Close the session before exiting, whatever the server outcome
    if let Err(e) = ledger.close() {
        error!("Failed to close session: {}", e);
    }

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Shutdown complete");
}
