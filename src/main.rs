//! resilink - Resilient WebSocket client
//!
//! Keeps one connection open, prints every lifecycle event as a JSON line on stdout
//! and forwards each stdin line as a message.

use clap::{Parser, Subcommand};
use resilink::config::LinkConfig;
use resilink::observability::{init_default_logging, init_logging, LogFormat};
use resilink::ConnectionManager;
use std::env;
use std::path::PathBuf;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};

/// Resilient persistent WebSocket client
#[derive(Parser)]
#[command(name = "resilink")]
#[command(about = "Resilient WebSocket client with circuit breaking, backoff and heartbeats")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Endpoint URL, overriding the configuration file
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream events until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_observability(cli.verbose);
    info!("Starting resilink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref(), cli.url.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn init_observability(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    init_logging(level, LogFormat::parse(&format), false);
}

fn load_configuration(
    config_path: Option<&std::path::Path>,
    url: Option<&str>,
) -> Result<LinkConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => ["resilink.toml", "config/resilink.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    };

    let mut config = match (path, url) {
        (Some(path), _) => {
            info!("Loading configuration from: {}", path.display());
            LinkConfig::load_from_file(&path)?
        }
        (None, Some(url)) => LinkConfig::for_endpoint(url),
        (None, None) => {
            return Err("No configuration found. Use -c/--config, --url or resilink.toml".into())
        }
    };

    if let Some(url) = url {
        config.endpoint.url = url.to_string();
    }
    config.validate()?;
    Ok(config)
}

async fn run_client(config: LinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::from_config(&config)?;

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = manager.connect().await {
        warn!(error = %e, "Initial connection failed");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                let signal = signal?;
                info!(signal, "Received shutdown signal");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match manager.send_text(line).await {
                    Ok(delivery) => debug!(?delivery, "Forwarded stdin line"),
                    Err(e) => error!(error = %e, "Failed to forward stdin line"),
                },
                None => {
                    debug!("stdin closed, waiting for shutdown signal");
                    stdin_open = false;
                }
            }
        }
    }

    manager.destroy().await;
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer task failed");
    }

    println!("{}", serde_json::to_string_pretty(&manager.status())?);
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|_| "SIGINT")
    }
}

fn handle_config_command(
    config: &LinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(endpoint = %config.endpoint.url, "Configuration is valid");
    Ok(())
}
