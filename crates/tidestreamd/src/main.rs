//! tidestreamd - the tidestream daemon
//!
//! Loads the configuration, initialises logging, builds the streamer
//! and runs it until a signal or a fatal error.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tidestream::{Config, ExtensionPoints, StartOutcome, Streamer, StreamerError};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Exit codes, stable for supervisors.
const EXIT_CONFIG_OPEN: u8 = 3;
const EXIT_CONFIG_READ: u8 = 4;
const EXIT_CONFIG_DECODE: u8 = 5;
const EXIT_CONFIG_CONNECTION: u8 = 6;
const EXIT_FATAL: u8 = 10;
const EXIT_NO_TIMESCALEDB: u8 = 17;

#[derive(Parser)]
#[command(name = "tidestreamd")]
#[command(version, about = "CDC event streaming for TimescaleDB hypertables")]
struct Cli {
    /// Load configuration from FILE
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Show debug output
    #[arg(short, long)]
    debug: bool,

    /// Collect caller information for log messages
    #[arg(long)]
    caller: bool,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(cli.caller)
                .with_line_number(cli.caller),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    let document = match &cli.config {
        Some(path) => {
            let mut file = match std::fs::File::open(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("Configuration file couldn't be opened: {err}");
                    return Err(ExitCode::from(EXIT_CONFIG_OPEN));
                }
            };
            use std::io::Read;
            let mut document = String::new();
            if let Err(err) = file.read_to_string(&mut document) {
                eprintln!("Configuration file couldn't be read: {err}");
                return Err(ExitCode::from(EXIT_CONFIG_READ));
            }
            document
        }
        None => String::new(),
    };

    let config = match Config::from_yaml(&document) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration file couldn't be decoded: {err}");
            return Err(ExitCode::from(EXIT_CONFIG_DECODE));
        }
    };

    if config.postgresql.connection.is_empty() {
        eprintln!("PostgreSQL connection string required");
        return Err(ExitCode::from(EXIT_CONFIG_CONNECTION));
    }

    Ok(config)
}

fn exit_code_for(err: &StreamerError) -> u8 {
    match err {
        StreamerError::ExtensionMissing => EXIT_NO_TIMESCALEDB,
        _ => EXIT_FATAL,
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("SIGQUIT handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    // compiled-in plug-ins register their sinks, state storages and
    // naming strategies here
    let mut extensions = ExtensionPoints::new();
    if let Err(err) = extensions.load(&[]) {
        error!("plug-in initialisation failed: {err}");
        return ExitCode::from(EXIT_FATAL);
    }

    let streamer = match Streamer::new(config, extensions) {
        Ok(streamer) => streamer,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(exit_code_for(&err));
        }
    };

    match streamer.start().await {
        Ok(StartOutcome::SnapshotOnlyDone) => {
            info!("snapshot-only run complete");
            return ExitCode::SUCCESS;
        }
        Ok(StartOutcome::Streaming) => {}
        Err(err) => {
            error!("startup failed: {err}");
            return ExitCode::from(exit_code_for(&err));
        }
    }

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            if let Err(err) = streamer.stop().await {
                error!("error while stopping: {err}");
                return ExitCode::from(EXIT_FATAL);
            }
        }
        result = streamer.wait() => {
            if let Err(err) = result {
                error!("replication failed: {err}");
                let _ = streamer.stop().await;
                return ExitCode::from(exit_code_for(&err));
            }
        }
    }

    ExitCode::SUCCESS
}
