//! Blobber operator tool
//!
//! Opens the node's stores from config and runs one maintenance command.
//!
//! ## Usage
//!
//! ```bash
//! # Print an allocation's root hash
//! blobber root <allocation>
//!
//! # Check every stored hash against its children
//! blobber verify <allocation>
//!
//! # List a directory as JSON
//! blobber list <allocation> /docs
//!
//! # Recompute all directory hashes after an interrupted commit
//! blobber rehash <allocation>
//!
//! # Drop a connection's staged uploads
//! blobber abort <allocation> <connection>
//!
//! # Challenges not yet committed or failed
//! blobber challenges
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use blobber::{
    setup_entities, AllocationLocks, ChallengeProcessor, Config, DiskFileStore, ReferenceStore,
    SledStore, WriteCommitter,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blobber")]
#[command(about = "Storage node maintenance for allocation trees")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "BLOBBER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "BLOBBER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the root hash of an allocation
    Root { allocation: String },
    /// Verify every stored hash of an allocation
    Verify { allocation: String },
    /// List the children of a directory
    List {
        allocation: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Recompute every directory hash of an allocation
    Rehash { allocation: String },
    /// Abort an upload connection
    Abort { allocation: String, connection: String },
    /// List open challenges
    Challenges,
    /// Committed file statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("blobber=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(Config::default().config_path())?,
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    info!(storage_dir = %config.storage_dir.display(), "Opening blobber stores");
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let store = Arc::new(SledStore::open(&config.sled_config())?);
    let registry = Arc::new(setup_entities(store.clone()));
    let ref_store = Arc::new(ReferenceStore::new(Arc::clone(&registry)));
    let file_store =
        Arc::new(DiskFileStore::new(config.files_dir()).await?.with_chunk_size(config.chunk_size));
    let ctx = registry.begin();

    match args.command {
        Command::Root { allocation } => {
            let root = ref_store.get_root(&ctx, &allocation)?;
            println!("{}", root.hash);
        }
        Command::Verify { allocation } => {
            let root_hash = ref_store.verify_tree(&ctx, &allocation)?;
            info!(allocation_id = %allocation, root_hash = %root_hash, "Tree verified");
            println!("{}", root_hash);
        }
        Command::List { allocation, path } => {
            let rows = ref_store.list_directory(&ctx, &allocation, &path)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Rehash { allocation } => {
            let root = ref_store.rebuild_hashes(&ctx, &allocation)?;
            let written = ctx.commit()?;
            info!(allocation_id = %allocation, refs = written, "Rebuilt hashes");
            println!("{}", root.hash);
        }
        Command::Abort {
            allocation,
            connection,
        } => {
            let committer = WriteCommitter::new(
                Arc::clone(&registry),
                Arc::clone(&ref_store),
                file_store.clone(),
                Arc::new(AllocationLocks::new()),
            );
            let deleted = committer.abort(&ctx, &allocation, &connection).await?;
            println!("{} temp files removed", deleted);
        }
        Command::Challenges => {
            let processor = ChallengeProcessor::new(
                Arc::clone(&registry),
                Arc::clone(&ref_store),
                config.max_challenge_retries,
            );
            let open = processor.list_open(&ctx)?;
            println!("{}", serde_json::to_string_pretty(&open)?);
        }
        Command::Stats => {
            let stats = file_store.stats().await?;
            println!(
                "allocations: {}\nfiles: {}\nbytes: {}",
                stats.allocations, stats.total_files, stats.total_bytes
            );
        }
    }

    store.flush().await?;
    Ok(())
}
