//! video-tracking - records video playback sessions.

use tracing::{debug, error};
use video_tracking::cli::{Cli, CliCommand, OutputFormat};
use video_tracking::config::{Config, DEFAULT_CONNECTION_NAME};
use video_tracking::db::CommandExecutor;
use video_tracking::error::{Result, TrackerError};
use video_tracking::logging;
use video_tracking::tracking::{self, TrackedPlayback};

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    logging::init_stderr_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let target = resolve_target(&cli)?;

    match cli.command {
        CliCommand::Record { payload } => {
            let id = tracking::record(Some(&target), &payload).await?;
            println!("{id}");
        }
        CliCommand::InitSchema => {
            let mut executor = CommandExecutor::with_connection_string(target)?;
            let outcome = tracking::ensure_schema(&mut executor).await;
            executor.close_with(outcome).await?;
        }
        CliCommand::List { limit, output } => {
            let format: OutputFormat = output.parse().map_err(TrackerError::config)?;
            let mut executor = CommandExecutor::with_connection_string(target)?;
            let outcome = tracking::recent_events(&mut executor, limit).await;
            let events = executor.close_with(outcome).await?;
            print_events(&events, format)?;
        }
    }

    Ok(())
}

/// Resolves the connection target: `--connection` first, then the configured
/// `ConnString` (environment override included).
fn resolve_target(cli: &Cli) -> Result<String> {
    if let Some(target) = cli.connection_target() {
        return Ok(target.to_string());
    }

    let config_path = cli.config_path();
    debug!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;
    config.connection_string(DEFAULT_CONNECTION_NAME)
}

fn print_events(events: &[TrackedPlayback], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for event in events {
                println!(
                    "{}\t{}\t{}\t{}\t{}s",
                    event.id,
                    event.start.format("%Y-%m-%d %H:%M:%S"),
                    event.end.format("%Y-%m-%d %H:%M:%S"),
                    event.url,
                    event.play_time_seconds
                );
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(events)
                .map_err(|e| TrackerError::internal(format!("Failed to encode output: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}
