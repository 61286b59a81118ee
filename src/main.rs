use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use pipulate::config::Config;
use pipulate::store::sqlite::SqliteStore;
use pipulate::store::Store;

#[derive(Parser)]
#[command(name = "pipulate", about = "Inspect the pipeline job store")]
struct Cli {
    /// Path to pipulate.toml (defaults apply when absent)
    #[arg(long, default_value = "pipulate.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List pipeline jobs, newest first
    Jobs {
        /// Only jobs owned by this workflow
        #[arg(long)]
        app: Option<String>,
    },
    /// Print one job's full JSON state
    Show { pkey: String },
    /// Delete a job record (the only cleanup path; records are never
    /// deleted automatically)
    Delete { pkey: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pipulate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;

    std::fs::create_dir_all(config.data_dir()).with_context(|| {
        format!("failed to create data directory: {}", config.data_dir().display())
    })?;
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(config.db_path())
            .with_context(|| format!("failed to open store: {}", config.db_path().display()))?,
    );

    match cli.command {
        Command::Jobs { app } => {
            let records = store.list_records(app.as_deref()).await;
            if records.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  app={}  updated={}",
                    record.pkey,
                    record.app_name,
                    record.updated.to_rfc3339()
                );
            }
        }
        Command::Show { pkey } => match store.get_record(&pkey).await {
            Some(record) => {
                let pretty = serde_json::to_string_pretty(&record.data)
                    .context("failed to render job state")?;
                println!("{pretty}");
            }
            None => println!("No job found for '{pkey}'."),
        },
        Command::Delete { pkey } => {
            if store.delete_record(&pkey).await? {
                println!("Deleted '{pkey}'.");
            } else {
                println!("No job found for '{pkey}'.");
            }
        }
    }

    Ok(())
}
