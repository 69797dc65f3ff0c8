use anyhow::{Context, Result};
use booking_jobs::clock::SystemClock;
use booking_jobs::config::{AppConfig, CliConfig, FileConfig, Role};
use booking_jobs::metrics;
use booking_jobs::runtime::JobRuntime;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding coordination.db and booking.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Optional TOML config file. Its values override the CLI.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Identity of this process in locks, messages and run history.
    /// Defaults to a random UUID.
    #[clap(long)]
    pub instance_id: Option<String>,

    /// Which parts of the job pipeline this process runs.
    #[clap(long, value_enum, default_value_t = Role::All)]
    pub role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli = CliConfig {
        db_dir: cli_args.db_dir,
        instance_id: cli_args.instance_id,
        role: cli_args.role,
    };
    let config = AppConfig::resolve(&cli, file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let runtime = JobRuntime::open(config, Arc::new(SystemClock)).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    runtime.run(shutdown).await?;

    info!("Final metrics:\n{}", metrics::render_metrics());
    Ok(())
}
