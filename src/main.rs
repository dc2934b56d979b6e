mod classify;
mod cli;
mod config;
mod error;
mod extraction_db;
mod heuristics;
mod llm_extract;
mod llm_response;
mod output;
mod pdf_pages;
mod processor;
mod reconcile;
mod record;
mod server;
mod usage;

use clap::{Parser, Subcommand};
use extraction_db::ExtractionStore;
use processor::Processor;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mrn_extract")]
#[command(version)]
#[command(about = "Extract consignment records and MRN pages from freight PDFs", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, env = "MRN_EXTRACT_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every PDF in a directory
    Batch {
        /// Input directory
        #[arg(short, long = "input-dir", value_name = "DIR")]
        input: Option<PathBuf>,

        /// Output directory
        #[arg(short, long = "output-dir", value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Process a single PDF and print the result as JSON
    File {
        /// Input PDF file
        #[arg(value_name = "PDF")]
        pdf: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Show recent extractions
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one logged extraction as JSON
    Show {
        /// Extraction id as listed by `history`
        id: String,
    },

    /// Start the HTTP upload API
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Cli::parse();
    let cfg = config::Config::load_or_default(&args.config)?;
    let store = ExtractionStore::new(&cfg.paths.db_path)?;

    match args.command {
        Commands::History { limit } => cli::run_history(&store, limit)?,
        Commands::Show { id } => cli::run_show(&store, &id)?,
        Commands::Batch { input, output } => {
            let processor = Processor::new(llm_extract::build_extractor(&cfg.ai)?);
            let input = input.unwrap_or_else(|| cfg.paths.input_dir.clone());
            let output = output.unwrap_or_else(|| cfg.paths.output_dir.clone());
            let summary = cli::run_batch(&cfg, &processor, &store, &input, &output).await?;
            info!(
                successful = summary.successful,
                failed = summary.failed,
                "Batch finished"
            );
        }
        Commands::File { pdf, output } => {
            let processor = Processor::new(llm_extract::build_extractor(&cfg.ai)?);
            let output = output.unwrap_or_else(|| cfg.paths.output_dir.clone());
            cli::run_file(&processor, &store, &pdf, &output).await?;
        }
        Commands::Serve => {
            let processor = Processor::new(llm_extract::build_extractor(&cfg.ai)?);
            server::run_server(&cfg, processor, store).await?;
        }
    }

    Ok(())
}
