//! Certkeeper - Main entry point
//!
//! One binary, two daemons: `certkeeper issue` runs the ACME issuer,
//! `certkeeper watch` runs the proxy-side watcher. `certkeeper test`
//! validates a configuration file and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use certkeeper::shutdown::listen_for_signals;
use certkeeper::{CommandReloadTarget, IssuerDaemon, WatcherDaemon};
use certkeeper_config::{validate::validate_config, Config};

/// Certkeeper - TLS certificate lifecycle coordination for a reverse proxy
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTKEEPER_CONFIG",
        default_value = "certkeeper.toml",
        global = true
    )]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the issuer daemon: obtain and renew certificates over ACME
    Issue,
    /// Run the watcher daemon: reload the proxy when certificates change
    Watch,
    /// Validate configuration file and exit
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging level priority: RUST_LOG > --verbose > info.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Test => test_config(&cli.config),
        Commands::Issue => run_issuer(&cli.config).await,
        Commands::Watch => run_watcher(&cli.config).await,
    }
}

/// Test configuration file and exit.
///
/// Exits non-zero when the file fails to load or deep validation reports
/// errors; warnings alone do not fail the test.
fn test_config(config_path: &str) -> Result<()> {
    info!("Testing configuration file: {}", config_path);

    let config = Config::from_file(config_path).context("Failed to load configuration file")?;

    let result = validate_config(&config);

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    for validation_error in &result.errors {
        error!("{}", validation_error);
    }

    if !result.is_ok() {
        anyhow::bail!(
            "configuration file {} test failed: {} error(s)",
            config_path,
            result.errors.len()
        );
    }

    info!("Configuration test successful:");
    info!("  - {} domain(s)", config.issuer.domains.len());
    info!("  - bundle root: {}", config.bundle.root.display());
    info!(
        "  - renewal window: {} day(s), checked every {} hour(s)",
        config.issuer.renew_before_days, config.issuer.check_interval_hours
    );

    println!("certkeeper: configuration file {config_path} test is successful");
    Ok(())
}

/// Run the issuer daemon until SIGTERM/SIGINT.
async fn run_issuer(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration file")?;
    let shutdown = listen_for_signals().context("Failed to register signal handlers")?;

    let daemon = IssuerDaemon::connect(config)
        .await
        .context("Failed to initialize issuer")?;

    daemon.run(shutdown).await.context("Issuer daemon failed")?;
    info!("Issuer stopped");
    Ok(())
}

/// Run the watcher daemon until SIGTERM/SIGINT.
async fn run_watcher(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration file")?;
    let shutdown = listen_for_signals().context("Failed to register signal handlers")?;

    let target = CommandReloadTarget::new(
        config.watcher.validate_command.clone(),
        config.watcher.reload_command.clone(),
    )
    .context("Reload command is not configured")?;

    let daemon = WatcherDaemon::new(config, target);
    daemon.run(shutdown).await.context("Watcher daemon failed")?;
    info!("Watcher stopped");
    Ok(())
}
