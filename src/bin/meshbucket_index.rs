//! CLI entry point for meshbucket-index: inspect or invalidate the
//! persisted cluster index.

use clap::{Parser, Subcommand};
use meshbucket::cluster::manager::ClusterSettings;
use meshbucket::cluster::ClusterManager;
use meshbucket::index::sqlite::SqliteIndexStore;
use meshbucket::index::{IndexStore, ObjectLocation};
use meshbucket::storage::registry::BackendRegistry;
use meshbucket::tasks::BackgroundWorker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshbucket-index", about = "meshbucket cluster index tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the live index as JSON
    Show {
        #[arg(long, default_value = "meshbucket.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
        #[arg(long, default_value = "-")]
        output: String,
    },
    /// Drop the persisted index; the server rebuilds it on next access
    Clear {
        #[arg(long, default_value = "meshbucket.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
    },
    /// List every backend now and persist a fresh index
    Rebuild {
        #[arg(long, default_value = "meshbucket.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
    },
}

#[derive(Serialize)]
struct IndexDump {
    expires_at: Option<String>,
    entries: BTreeMap<String, ObjectLocation>,
}

fn open_store(config: &meshbucket::config::Config, db: Option<String>) -> anyhow::Result<SqliteIndexStore> {
    let path = match db {
        Some(p) => p,
        None => {
            if config.index.engine == "memory" {
                anyhow::bail!("index.engine is 'memory'; nothing is persisted");
            }
            config.index.path.clone()
        }
    };
    SqliteIndexStore::new(&path)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Show { config, db, output } => run_show(config, db, output).await,
        Commands::Clear { config, db } => run_clear(config, db).await,
        Commands::Rebuild { config, db } => run_rebuild(config, db).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_show(config: PathBuf, db: Option<String>, output: String) -> anyhow::Result<()> {
    let config = meshbucket::config::load_config(&config)?;
    let store = open_store(&config, db)?;

    let Some(index) = store.load().await? else {
        eprintln!("No live index (absent or expired)");
        return Ok(());
    };
    let dump = IndexDump {
        expires_at: store.expires_at()?.map(|t| t.to_rfc3339()),
        entries: index.into_iter().collect(),
    };
    let json = serde_json::to_string_pretty(&dump)?;

    if output == "-" {
        println!("{json}");
    } else {
        std::fs::write(&output, format!("{json}\n"))?;
        eprintln!("Wrote {} entries to {}", dump.entries.len(), output);
    }
    Ok(())
}

async fn run_clear(config: PathBuf, db: Option<String>) -> anyhow::Result<()> {
    let config = meshbucket::config::load_config(&config)?;
    let store = open_store(&config, db)?;
    store.clear().await?;
    eprintln!("Index cleared");
    Ok(())
}

async fn run_rebuild(config: PathBuf, db: Option<String>) -> anyhow::Result<()> {
    let config = meshbucket::config::load_config(&config)?;
    let store: Arc<dyn IndexStore> = Arc::new(open_store(&config, db)?);
    let registry = BackendRegistry::from_descriptors(
        &config.backends,
        Duration::from_secs(config.cluster.backend_timeout_secs),
    )?;
    let manager = ClusterManager::new(
        Arc::new(registry),
        store,
        ClusterSettings::from_config(&config),
        BackgroundWorker::new(1),
    );
    let index = manager.rebuild_index().await?;
    eprintln!("Index rebuilt with {} entries", index.len());
    Ok(())
}
