use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "smof-cli")]
#[command(about = "Sports Memorabilia Opportunity Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan all enabled sources once and write the run's reports.
    Scan,
    /// Print a markdown digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Serve the dashboard over the latest run reports.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => {
            let summary = smof_pipeline::run_scan_once_from_env().await?;
            println!(
                "scan complete: run_id={} sources={} listings={} clusters={} suppressed={} skipped={} reports={}",
                summary.run_id,
                summary.scanned_sources,
                summary.listings,
                summary.clusters,
                summary.duplicates_suppressed,
                summary.malformed_records,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            let digest = smof_pipeline::report_daily_markdown(runs, None)?;
            println!("{digest}");
        }
        Commands::Serve => {
            smof_web::serve_from_env().await?;
        }
    }

    Ok(())
}
