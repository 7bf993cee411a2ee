/// Parley CLI - Main entry point
use parley_core::cli_app;
use parley_core::Config;
use std::env;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (stderr, so command output stays clean)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let bin = args.first().cloned().unwrap_or_else(|| "parley".to_string());
    let (config, command) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    debug!("Using data dir {:?}", config.resolved_data_dir());

    cli_app::run(&bin, config, command).await
}
