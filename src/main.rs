mod cache;
mod config;
mod documents;
mod error;
mod export;
mod geocode;
mod heuristics;
mod layout;
mod llm_extract;
mod pdf;
mod upload;

use cache::JsonCache;
use clap::{Parser, Subcommand};
use config::Config;
use documents::Pipeline;
use error::BoxError;
use geocode::{Geocode, Nominatim};
use llm_extract::{AddressExtractor, ChatEndpoint, Complete, ExtractAddress, Summarizer};
use pdf::{LopdfOpener, OpenDocument, PageLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upload::{DriveUploader, NoUpload, Upload};

#[derive(Parser)]
#[command(name = "notice_map", version, about = "Turn municipal planning notices into map layers")]
struct Cli {
    /// TOML configuration file; built-in defaults are used when it is missing
    #[arg(long, default_value = "notice_map.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the notice and public-participation folders and export map data
    Run {
        /// Also write a geocoded KML layer
        #[arg(long)]
        kml: bool,
    },
    /// Process one notice directory and print the records as JSON
    Process { dir: PathBuf },
    /// Dump the text of one PDF and the fields found in it
    Inspect { pdf: PathBuf },
    /// Extract a street address from free text
    ExtractAddress {
        /// Cache key, e.g. the email id
        #[arg(long)]
        id: String,
        text: String,
    },
    /// Look up the coordinates of an address
    Geocode { address: String },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let cli = Cli::parse();
    let cfg = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run { kml } => run(&cfg, kml).await,
        Commands::Process { dir } => {
            let records = pipeline(&cfg).await?.process_documents(&dir).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Commands::Inspect { pdf } => inspect(&cfg, &pdf).await,
        Commands::ExtractAddress { id, text } => {
            let extractor = AddressExtractor::new(completion(&cfg).await?, JsonCache::new(cfg.cache_path("addresses.json")));
            println!("{}", extractor.extract_address(&text, &id).await?);
            Ok(())
        }
        Commands::Geocode { address } => {
            match Nominatim::new(&cfg.geocoder)?.geocode(&address).await {
                Some(c) => println!("{}, {}", c.latitude, c.longitude),
                None => println!("no coordinates found"),
            }
            Ok(())
        }
    }
}

async fn completion(cfg: &Config) -> Result<Option<Arc<dyn Complete>>, BoxError> {
    Ok(ChatEndpoint::from_config(&cfg.llm)
        .await?
        .map(|endpoint| Arc::new(endpoint) as Arc<dyn Complete>))
}

async fn pipeline(cfg: &Config) -> Result<Pipeline, BoxError> {
    let summarizer = Summarizer::new(completion(cfg).await?, JsonCache::new(cfg.cache_path("summaries.json")));
    let uploader: Arc<dyn Upload> = if cfg.drive.enabled {
        Arc::new(DriveUploader::connect(&cfg.drive, JsonCache::new(cfg.cache_path("short_links.json"))).await?)
    } else {
        info!("Drive upload disabled, records will have no link");
        Arc::new(NoUpload)
    };

    Ok(Pipeline {
        cfg: cfg.extraction.clone(),
        opener: Arc::new(LopdfOpener),
        summarizer: Arc::new(summarizer),
        uploader,
    })
}

async fn run(cfg: &Config, kml: bool) -> Result<(), BoxError> {
    let pipeline = pipeline(cfg).await?;
    let geocoder = if kml && cfg.geocoder.enabled {
        Some(Nominatim::new(&cfg.geocoder)?)
    } else {
        None
    };
    let today = time::OffsetDateTime::now_utc().date();
    let output_dir = Path::new(&cfg.paths.output_dir);
    std::fs::create_dir_all(output_dir)?;

    for (prefix, root) in [("notice", &cfg.paths.notice_dir), ("public", &cfg.paths.public_dir)] {
        let records = pipeline.process_all_attachments(Path::new(root)).await?;
        export::export_csv(output_dir, prefix, today, &records)?;
        if kml {
            let geocoder = geocoder.as_ref().map(|g| g as &dyn Geocode);
            export::export_kml(output_dir, prefix, today, &records, geocoder).await?;
        }
    }

    Ok(())
}

async fn inspect(cfg: &Config, path: &Path) -> Result<(), BoxError> {
    let text = pdf::plain_text(path)?;
    let preview: String = text.chars().take(2000).collect();
    println!("--- text ({} chars) ---\n{preview}", text.chars().count());

    let owned = path.to_path_buf();
    let source = tokio::task::spawn_blocking(move || LopdfOpener.open(&owned)).await??;
    let pages = PageLoader::new(source, cfg.extraction.page_timeout());
    println!("--- pages: {}, scanned: {} ---", pages.page_count(), pages.looks_like_scanned());

    // no backend: the cleaned description is shown instead of a summary
    let passthrough = Summarizer::new(None, JsonCache::new(cfg.cache_path("summaries.json")));
    let doc_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let fields = heuristics::extract_notice(&pages, &doc_id, &cfg.extraction, &passthrough).await;
    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}
