//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch URLs the way a polite crawler would.
///
/// Each URL is checked against its host's robots.txt, fetched once without
/// following redirects, and summarized on stdout.
#[derive(Parser, Debug)]
#[command(name = "crawler-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Send HEAD instead of GET
    #[arg(long)]
    pub head: bool,

    /// JSON configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Skip robots.txt
    #[arg(long)]
    pub no_robots: bool,

    /// Override the User-Agent
    #[arg(short = 'a', long)]
    pub user_agent: Option<String>,

    /// Whole-call deadline in milliseconds (1-3600000)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    pub access_timeout: Option<u64>,
}
