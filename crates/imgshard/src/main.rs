mod input;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgshard_common::{logger, AppConfig};
use imgshard_store::{
    FileShardStore, IndexMode, Indexer, IndexerOptions, RetrievalEngine, ShardStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Find project root by looking for .git directory
fn find_project_root() -> Option<PathBuf> {
    let mut current_dir = std::env::current_dir().ok()?;

    loop {
        if current_dir.join(".git").exists() {
            return Some(current_dir);
        }

        if !current_dir.pop() {
            break;
        }
    }

    None
}

/// Load .env file from project root
fn load_dotenv_from_project_root() {
    if let Some(root) = find_project_root() {
        let env_path = root.join(".env");
        if env_path.exists() {
            dotenv::from_path(&env_path).ok();
        }
    } else {
        dotenv::dotenv().ok();
    }
}

#[derive(Parser)]
#[command(name = "imgshard")]
#[command(about = "imgshard - category-sharded image similarity search", long_about = None)]
struct Cli {
    /// Store root directory (overrides IMGSHARD_STORE_ROOT)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build shards from a JSON-lines file of classified, embedded images
    Build {
        /// Triples file: {"identity", "categories", "embedding", "source"?} per line
        #[arg(long)]
        input: PathBuf,

        /// Clear the store before writing
        #[arg(long, conflicts_with = "append")]
        replace: bool,

        /// Add only images not yet present in their shards
        #[arg(long)]
        append: bool,
    },

    /// Rank stored images against a query embedding
    Query {
        /// Candidate categories of the query image, most confident first
        #[arg(long, value_delimiter = ',', required = true)]
        categories: Vec<String>,

        /// JSON file holding the query embedding as an array of numbers
        #[arg(long)]
        embedding: PathBuf,

        /// Maximum number of results (defaults to IMGSHARD_TOP_K)
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List categories and their record counts
    Stats,

    /// List the images of a dataset folder with the identity each would get
    Scan {
        /// Dataset root folder
        dataset: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv_from_project_root();

    let mut config = AppConfig::from_env()?;
    if let Some(store) = cli.store {
        config.store_root = store;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    match cli.command {
        Commands::Build {
            input,
            replace,
            append,
        } => {
            config.ensure_directories()?;
            logger::setup_logging(&config.log_dir, &config.log_level)?;

            tracing::info!("imgshard build starting...");
            tracing::info!("  Store: {}", config.store_root.display());
            tracing::info!("  Input: {}", input.display());

            let store = Arc::new(FileShardStore::open(&config.store_root).await?);
            let indexer = Indexer::new(store, IndexerOptions::from(&config));
            let triples = input::read_triples(&input).await?;

            let report = if append {
                indexer.append(triples).await?
            } else {
                let mode = if replace {
                    IndexMode::FullReplace
                } else {
                    IndexMode::Additive
                };
                indexer.build(triples, mode).await?
            };

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Query {
            categories,
            embedding,
            top_k,
        } => {
            logger::setup_console_logging(&config.log_level)?;

            let query_embedding = input::read_embedding(&embedding).await?;
            let store = Arc::new(FileShardStore::open(&config.store_root).await?);
            let outcome = RetrievalEngine::new(store)
                .search(
                    &categories,
                    &query_embedding,
                    top_k.unwrap_or(config.default_top_k),
                )
                .await?;

            if outcome.is_empty() {
                eprintln!("No matching images found.");
            }
            for failure in &outcome.failed_categories {
                eprintln!("Skipped category '{}': {}", failure.category, failure.reason);
            }

            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Stats => {
            logger::setup_console_logging(&config.log_level)?;

            let store = FileShardStore::open(&config.store_root).await?;
            match store.dimension().await? {
                Some(dimension) => println!("dimension\t{}", dimension),
                None => println!("dimension\t-"),
            }

            for category in store.categories().await? {
                match store.load(&category).await {
                    Ok(shard) => println!("{}\t{}", category, shard.len()),
                    Err(e) => println!("{}\terror: {}", category, e),
                }
            }
        }
        Commands::Scan { dataset } => {
            logger::setup_console_logging(&config.log_level)?;

            let images = imgshard_vision::scan_images(&dataset).await?;
            let mut seen: HashMap<String, PathBuf> = HashMap::new();

            for path in images {
                let identity = imgshard_vision::identity_from_path(&path)
                    .with_context(|| format!("unusable image path {}", path.display()))?;
                if let Some(first) = seen.get(&identity) {
                    tracing::warn!(
                        "'{}' also used by {}; the later image will win",
                        identity,
                        first.display()
                    );
                }
                println!("{}\t{}", identity, path.display());
                seen.insert(identity, path);
            }
        }
    }

    Ok(())
}
