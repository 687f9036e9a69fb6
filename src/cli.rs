//! Command-line argument parsing for video-tracking.

use crate::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Output format for `list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One tab-separated line per playback.
    #[default]
    Text,
    /// A JSON array of playbacks.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Records video playback sessions in a SQL database.
#[derive(Parser, Debug)]
#[command(name = "video-tracking")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Connection string (e.g., sqlite://tracking.db or postgres://user@host/db).
    /// Overrides the configured ConnString.
    #[arg(short = 'c', long, value_name = "TARGET", global = true)]
    pub connection: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Record one playback from a `url,start,end` payload
    Record {
        #[arg(value_name = "PAYLOAD")]
        payload: String,
    },

    /// Create the VideoTracking table if it does not exist
    InitSchema,

    /// List the most recent playbacks
    List {
        /// Maximum number of playbacks to show
        #[arg(
            short = 'n',
            long,
            default_value_t = 20,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        limit: u32,

        /// Output format (text or json)
        #[arg(long, value_name = "FORMAT", default_value = "text")]
        output: String,
    },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise `VIDEO_TRACKING_CONFIG`
    /// or the platform default.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::resolve_path)
    }

    /// Returns the explicit connection target, if one was given.
    pub fn connection_target(&self) -> Option<&str> {
        self.connection.as_deref().filter(|t| !t.trim().is_empty())
    }
}
