//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Resumable metadata and PDF harvester for agricultural repositories.
///
/// Each run discovers new items, extracts metadata and PDF links from item
/// pages, and downloads PDFs. Interrupted runs resume where they stopped.
#[derive(Parser, Debug)]
#[command(name = "agri-harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the TOML config file (defaults apply when omitted)
    #[arg(short = 'C', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Registry database path (overrides storage.database_path)
    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Items processed in parallel per stage (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub concurrency: Option<u16>,

    /// Items taken by the extraction stage this run
    #[arg(long, value_name = "N")]
    pub extraction_cap: Option<usize>,

    /// Items taken by the download stage this run
    #[arg(long, value_name = "N")]
    pub download_cap: Option<usize>,

    /// Skip discovery and only advance items already in the registry
    #[arg(long)]
    pub skip_discovery: bool,

    /// Directory for JSON exports (overrides storage.report_dir)
    #[arg(long, value_name = "DIR")]
    pub report_dir: Option<PathBuf>,

    /// Downloaded PDFs listed in the sample export
    #[arg(long, default_value_t = 20, value_name = "N")]
    pub sample_size: usize,

    /// Do not write JSON exports after the run
    #[arg(long)]
    pub no_reports: bool,
}
