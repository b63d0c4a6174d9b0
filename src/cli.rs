//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Crawl wiki, issue tracker and web sources into indexable documents.
///
/// Harvester runs every configured group concurrently, writes one folder of
/// documents plus a metadata log per group, and hands each folder to its
/// upload destination once all of the group's targets have finished.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "harvester.toml")]
    pub config: PathBuf,

    /// Output directory, overriding `data_dir` from the configuration
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Only run the named group (repeatable)
    #[arg(short, long = "group", value_name = "NAME")]
    pub groups: Vec<String>,

    /// Maximum retry attempts for failed fetches (0-10, default 5 or the configured value)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Exit non-zero when any target or upload failed
    #[arg(long)]
    pub strict: bool,
}
