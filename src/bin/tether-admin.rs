use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether::app;
use tether::config::Config;
use tether::models::ShortUrl;

#[derive(Parser)]
#[command(name = "tether-admin")]
#[command(about = "Tether short url management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load short urls from a JSON file (an array of short url documents)
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },
    /// Print a short url and its routing rules
    Show {
        /// Short code
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = app::open_store(&config).await?;

    match cli.command {
        Commands::Import { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let urls: Vec<ShortUrl> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not an array of short urls", file.display()))?;

            for url in &urls {
                if url.id.trim().is_empty() {
                    bail!("short url with destination '{}' has an empty id", url.destination);
                }
                store.save_short_url(url).await?;
                println!("✓ Imported '{}' -> {} ({} rules)", url.id, url.destination, url.rules.len());
            }
            println!("Imported {} short urls", urls.len());
        }
        Commands::Show { code } => match store.find_short_url(&code).await? {
            Some(url) => println!("{}", serde_json::to_string_pretty(&url)?),
            None => {
                println!("⚠ Short url '{}' not found", code);
            }
        },
    }

    Ok(())
}
