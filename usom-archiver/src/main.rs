use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use usom_archiver::config::Config;
use usom_archiver::{IngestionContext, Ingestor, JsonFileSink, PageFileSource, RecordStore};

#[derive(Parser)]
#[command(version, about = "Archive the USOM malicious address list in Redis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the records of saved API pages, skipping ids already archived
    Ingest {
        /// JSON file holding one API page or an array of pages
        file: PathBuf,
        /// Continue after the last checkpoint instead of starting at the first page
        #[arg(long)]
        resume: bool,
    },
    /// Write every archived record to a JSON document, newest first
    Export {
        /// Defaults to OUTPUT_FILE
        file: Option<PathBuf>,
    },
    /// Delete every key under the archive prefix
    Clear,
    /// Print key counts and a few sample ids
    Status,
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn cancel_on_ctrl_c(context: IngestionContext) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, stopping after the current batch");
            context.cancel();
        }
    });
}

async fn run(command: Commands, config: Config) -> Result<()> {
    let store =
        Arc::new(RecordStore::connect(config.connection_config(), config.store_config()).await?);

    let result = match command {
        Commands::Ingest { file, resume } => {
            let mut source = PageFileSource::open(&file).await?;
            let start_batch = if resume {
                Ingestor::resume_from(&store).await?
            } else {
                0
            };
            let context = IngestionContext::new();
            cancel_on_ctrl_c(context.clone());

            let ingestor = Ingestor::new(
                store.clone(),
                context,
                config.save_interval,
                config.base_url.clone(),
            );
            let report = ingestor.run(&mut source, start_batch).await?;
            if !report.completed {
                info!("Run interrupted; continue with `ingest --resume`");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Export { file } => {
            let path = file.unwrap_or_else(|| PathBuf::from(&config.output_file));
            let mut sink = JsonFileSink::create(&path, config.base_url.clone())?;
            let summary = store.export_all(&mut sink).await?;
            info!(
                "Exported {} records to {} ({} orphaned ids skipped)",
                summary.exported,
                path.display(),
                summary.orphaned
            );
            Ok(())
        }
        Commands::Clear => {
            let deleted = store.clear_all().await?;
            println!("{deleted}");
            Ok(())
        }
        Commands::Status => {
            let status = store.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    };

    store.close().await?;
    result
}

#[tokio::main]
async fn main() {
    setup_tracing();
    let cli = Cli::parse();

    let config = match Config::init_from_env()
        .context("Failed to load configuration from environment variables")
        .and_then(|config| config.validate().map(|_| config))
    {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };
    info!("Configuration loaded: {:?}", config);

    if let Err(e) = run(cli.command, config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
