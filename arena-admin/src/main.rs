//! arena-admin: operator CLI over the arena document store.
//!
//! Reads its store configuration from `ARENA_*` environment variables, so it
//! points at whatever backend the app itself uses.

use std::error::Error;
use std::path::PathBuf;

use arena_store::{normalize, Collection, DocumentStore, StoreConfig, StoreError};
use clap::{Parser, Subcommand};
use log::info;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "arena-admin")]
#[command(about = "Inspect, export and import the arena document store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the record count of every collection
    Stats,
    /// Write the whole graph as pretty JSON
    Export {
        /// Output file (stdout if omitted)
        file: Option<PathBuf>,
    },
    /// Replace the whole graph with the contents of a JSON file
    Import {
        file: PathBuf,
    },
    /// Print a collection, or one record of it
    Show {
        collection: Collection,
        /// Value of the record's `id` field
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = StoreConfig::from_env();
    let store = DocumentStore::open(&config)?;
    info!("Using {} backend", store.backend_kind());

    match cli.command {
        Commands::Stats => {
            let graph = store.read_all().await?;
            for (collection, records) in graph.iter() {
                println!("{:<14} {:>8}", collection.as_str(), records.len());
            }
            println!("{:<14} {:>8}", "total", graph.record_count());
        }
        Commands::Export { file } => {
            let graph = store.read_all().await?;
            let json = serde_json::to_string_pretty(&graph)?;
            match file {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    info!("Exported {} records to {}", graph.record_count(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Import { file } => {
            let bytes = tokio::fs::read(&file).await?;
            let raw: Value = serde_json::from_slice(&bytes)?;
            let incoming = normalize(raw);
            let count = incoming.record_count();
            store
                .mutate_all(|_| async move { Ok::<_, StoreError>(incoming) })
                .await?;
            info!("Imported {count} records from {}", file.display());
        }
        Commands::Show { collection, id } => {
            let records = match id {
                Some(id) => store.find_by(collection, "id", &Value::String(id)).await?,
                None => store.read_collection(collection).await?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
