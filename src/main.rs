//! CLI entry point for crawler-fetch.

use anyhow::{Context, Result};
use clap::Parser;
use crawler_fetch::{CrawlerClient, FetchConfig, FetchResponse, HttpFetcher};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    config.validate().context("invalid configuration")?;
    let fetcher = HttpFetcher::new(config);
    fetcher.init()?;

    let mut failed = 0usize;
    for url in &args.urls {
        let outcome = if args.head {
            fetcher.do_head(url).await
        } else {
            fetcher.do_get(url).await
        };
        match outcome {
            Ok(response) => {
                println!("{}", summarize(&response));
                if let Err(e) = response.dispose() {
                    warn!(url = %url, error = %e, "failed to remove spool file");
                }
            }
            Err(e) => {
                failed += 1;
                println!("{url}\tERROR\t{e}");
            }
        }
    }

    let sitemaps = fetcher.session().sitemaps();
    for sitemap in &sitemaps {
        println!("sitemap\t{sitemap}");
    }

    fetcher.close();
    info!(total = args.urls.len(), failed, sitemaps = sitemaps.len(), "Fetch complete");

    if failed > 0 {
        anyhow::bail!("{failed} of {} fetches failed", args.urls.len());
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<FetchConfig> {
    let mut config = match &args.config {
        Some(path) => FetchConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FetchConfig::default(),
    };
    if args.no_robots {
        config.robots.enabled = false;
    }
    if let Some(user_agent) = &args.user_agent {
        config.user_agent.clone_from(user_agent);
    }
    if args.access_timeout.is_some() {
        config.access_timeout_ms = args.access_timeout;
    }
    Ok(config)
}

fn summarize(response: &FetchResponse) -> String {
    let mut line = format!(
        "{}\t{}\t{}",
        response.url(),
        response.status_code(),
        response.method()
    );
    if let Some(location) = response.redirect_location() {
        line.push_str(&format!("\t-> {location}"));
        return line;
    }
    line.push_str(&format!(
        "\t{}; charset={}\t{} bytes",
        response.mime_type().unwrap_or("-"),
        response.charset().unwrap_or("-"),
        response
            .content_length()
            .map_or_else(|| "?".to_string(), |n| n.to_string())
    ));
    if let Some(modified) = response.last_modified() {
        line.push_str(&format!("\t{}", httpdate::fmt_http_date(modified)));
    }
    line
}
