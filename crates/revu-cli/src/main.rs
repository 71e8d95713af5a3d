mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use revu_sync::PipelineConfig;

use crate::logging::LogSession;

#[derive(Debug, Parser)]
#[command(name = "revu")]
#[command(about = "App store review collection, cleaning and EDA reports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect (or load), clean and persist one batch of reviews.
    Run,
    /// Write EDA summaries for a processed review CSV.
    Summarize {
        #[arg(long)]
        csv: PathBuf,
        /// Defaults to ./reports/eda.
        #[arg(long)]
        outdir: Option<PathBuf>,
    },
    /// Apply the SQLite schema to the configured database.
    Migrate,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let _logs = LogSession::start(&config.logs_dir, "pipeline")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = revu_sync::run_pipeline_from_env().await?;
            println!(
                "run complete: run_id={} raw={} processed={} db_rows={} processed_csv={}",
                summary.run_id,
                summary.rows_raw,
                summary.rows_processed,
                summary
                    .rows_upserted
                    .map_or_else(|| "skipped".to_string(), |n| n.to_string()),
                summary.processed_csv.display()
            );
        }
        Commands::Summarize { csv, outdir } => {
            let paths = revu_report::write_report(&csv, outdir.as_deref()).await?;
            println!("Saved:\n- {}\n- {}", paths.json.display(), paths.markdown.display());
            if let Some(time_csv) = paths.time_csv {
                println!("- {}", time_csv.display());
            }
        }
        Commands::Migrate => {
            let db_path = revu_sync::migrate_from_env().await?;
            println!("schema applied: {}", db_path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["revu"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn summarize_takes_csv_and_optional_outdir() {
        let cli = Cli::try_parse_from(["revu", "summarize", "--csv", "data/processed/x.csv"]).unwrap();
        match cli.command {
            Some(Commands::Summarize { csv, outdir }) => {
                assert_eq!(csv, PathBuf::from("data/processed/x.csv"));
                assert!(outdir.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["revu", "summarize"]).is_err());
    }
}
