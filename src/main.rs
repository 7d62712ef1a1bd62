use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use officer_linkage::{Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "officer-linkage", version, about = "Link officer records across sources into stable UIDs")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "linkage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge every source not yet in the reference table
    Merge {
        /// Merge only this source
        #[arg(long)]
        only: Option<String>,
    },

    /// Re-annotate merged sources with UIDs from the stored reference table
    Remerge,

    /// Resolve unit assignment timelines
    Units,

    /// List ambiguous matches waiting for whitelist review
    Review {
        #[arg(long)]
        source: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "officer_linkage=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut pipeline = Pipeline::new(config)?;
    info!(run_id = pipeline.run_id(), "starting run");

    match cli.command {
        Command::Merge { only } => {
            let reports = pipeline.merge(only.as_deref())?;
            if reports.is_empty() {
                println!("Nothing to merge: every configured source is already in the reference table");
            }
            for report in &reports {
                println!("{}", report.summary());
            }
        }
        Command::Remerge => {
            for (source, rows) in pipeline.remerge()? {
                println!("{}: {} rows annotated", source, rows);
            }
        }
        Command::Units => {
            let report = pipeline.resolve_units()?;
            println!(
                "{} officers: {} intervals in, {} erroneous, {} malformed, {} spans out",
                report.officers,
                report.input,
                report.erroneous,
                report.malformed,
                report.spans.len()
            );
        }
        Command::Review { source } => {
            let records = pipeline.review(source.as_deref())?;
            if records.is_empty() {
                println!("No ambiguous matches recorded");
            }
            for record in &records {
                println!(
                    "{} [{}] rule '{}': local ids {:?} <-> UIDs {:?} (run {})",
                    record.source,
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    record.ambiguity.rule,
                    record.ambiguity.local_ids,
                    record.ambiguity.uids,
                    record.run_id
                );
            }
        }
    }

    Ok(())
}
