//! DLC CLI - Command-line front end for the chunked downloader
//!
//! Fetches a single URL with the background engine, showing progress
//! while the scheduler works.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dlc_core::{Downloader, HandleOptions, Hints, Range};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// DLC - chunked, resumable HTTP downloads
#[derive(Parser)]
#[command(name = "dlc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Maximum concurrent connections
    #[arg(long, global = true, env = "DLC_MAX_HANDLES", default_value_t = Hints::DEFAULT_MAX_HANDLES)]
    max_handles: usize,

    /// Bytes fetched per range request
    #[arg(long, global = true, env = "DLC_CHUNK_SIZE", default_value_t = Hints::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long, global = true, env = "DLC_TIMEOUT", default_value_t = Hints::DEFAULT_TIMEOUT_SECS)]
    timeout: u32,

    /// Verify TLS certificates
    #[arg(long, global = true)]
    verify_tls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Byte range to fetch; the whole resource when omitted
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RangeArgs {
    /// First byte to fetch
    #[arg(long)]
    offset: Option<i64>,

    /// Number of bytes to fetch
    #[arg(long)]
    size: Option<i64>,
}

impl RangeArgs {
    pub fn to_range(self) -> Range {
        match (self.offset, self.size) {
            (None, None) => Range::UNKNOWN,
            (offset, Some(size)) => Range::new(offset.unwrap_or(0), size),
            (Some(offset), None) => Range::new(offset, -1),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL, replacing the destination
    Get {
        /// URL to download
        url: String,

        /// Destination file (defaults to the downloads directory)
        #[arg(short = 'o', long = "dest")]
        dest: Option<PathBuf>,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Continue a download, keeping what the destination already holds
    Resume {
        /// URL to download
        url: String,

        /// Destination file (defaults to the downloads directory)
        #[arg(short = 'o', long = "dest")]
        dest: Option<PathBuf>,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Print the content length of a URL
    Size {
        /// URL to probe
        url: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let hints = Hints {
        max_handles: cli.max_handles,
        chunk_size: cli.chunk_size,
        timeout_secs: cli.timeout,
    };
    let options = HandleOptions {
        verify_tls: cli.verify_tls,
        ..HandleOptions::default()
    };
    debug!("Using {:?} with {:?}", hints, options);
    let downloader = Downloader::with_options(hints, options)?;

    let succeeded = match cli.command {
        Commands::Get { url, dest, range } => {
            commands::download(&downloader, &url, dest, range.to_range(), false, cli.output)?
        }
        Commands::Resume { url, dest, range } => {
            commands::download(&downloader, &url, dest, range.to_range(), true, cli.output)?
        }
        Commands::Size { url } => commands::content_size(&downloader, &url, cli.output)?,
    };

    drop(downloader);
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_args() {
        assert_eq!(RangeArgs::default().to_range(), Range::UNKNOWN);
        let args = RangeArgs {
            offset: None,
            size: Some(10),
        };
        assert_eq!(args.to_range(), Range::new(0, 10));
        let args = RangeArgs {
            offset: Some(5),
            size: None,
        };
        assert!(!args.to_range().is_valid());
    }

    #[test]
    fn test_cli_parses_global_hints() {
        let cli = Cli::try_parse_from([
            "dlc",
            "get",
            "http://host/a.bin",
            "-o",
            "/tmp/a.bin",
            "--chunk-size",
            "1024",
            "--offset",
            "0",
            "--size",
            "4096",
        ])
        .unwrap();
        assert_eq!(cli.chunk_size, 1024);
        match cli.command {
            Commands::Get { dest, range, .. } => {
                assert_eq!(dest, Some(PathBuf::from("/tmp/a.bin")));
                assert_eq!(range.to_range(), Range::new(0, 4096));
            }
            _ => panic!("expected get"),
        }
    }
}
