//! Retail Price Sensitivity CLI
//!
//! A command-line tool for probing, querying and managing the price
//! sensitivity prediction service.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{model, predict, status};
use std::path::PathBuf;

/// Retail Price Sensitivity CLI
#[derive(Parser)]
#[command(name = "ppctl")]
#[command(
    author,
    version,
    about = "CLI for the Retail Price Sensitivity service",
    long_about = None
)]
pub struct Cli {
    /// API endpoint URL (can also be set via PPCTL_API_URL env var)
    #[arg(long, env = "PPCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check service health (exits 1 unless healthy)
    Health,

    /// Check service readiness (exits 1 unless ready)
    Ready,

    /// Predict price sensitivity for one basket
    Predict(PredictArgs),

    /// Predict a batch of baskets from a JSON array file
    Batch {
        /// Path to the batch file
        file: PathBuf,
    },

    /// Show the active model
    Info,

    /// Refetch the model from the store
    Reload,
}

#[derive(clap::Args)]
pub struct PredictArgs {
    /// Read the request from a JSON file instead of flags
    #[arg(long, conflicts_with_all = [
        "basket_size", "basket_type", "store_region", "store_format",
        "spend", "quantity", "prod_code_20", "prod_code_30",
    ])]
    pub file: Option<PathBuf>,

    /// Basket size (S, M or L)
    #[arg(long, required_unless_present = "file")]
    pub basket_size: Option<String>,

    /// Basket type (e.g. "Full Shop", "Top Up")
    #[arg(long, required_unless_present = "file")]
    pub basket_type: Option<String>,

    /// Store region code
    #[arg(long, required_unless_present = "file")]
    pub store_region: Option<String>,

    /// Store format (SS or LS)
    #[arg(long, required_unless_present = "file")]
    pub store_format: Option<String>,

    /// Basket spend
    #[arg(long, required_unless_present = "file")]
    pub spend: Option<f64>,

    /// Number of items
    #[arg(long, required_unless_present = "file")]
    pub quantity: Option<i64>,

    /// Product department code
    #[arg(long, required_unless_present = "file")]
    pub prod_code_20: Option<String>,

    /// Product group code
    #[arg(long, required_unless_present = "file")]
    pub prod_code_30: Option<String>,
}

impl PredictArgs {
    fn into_request(self) -> Result<client::PredictionRequest> {
        if let Some(path) = &self.file {
            return predict::read_request(path);
        }

        Ok(client::PredictionRequest {
            basket_size: self.basket_size.context("--basket-size is required")?,
            basket_type: self.basket_type.context("--basket-type is required")?,
            store_region: self.store_region.context("--store-region is required")?,
            store_format: self.store_format.context("--store-format is required")?,
            spend: self.spend.context("--spend is required")?,
            quantity: self.quantity.context("--quantity is required")?,
            prod_code_20: self.prod_code_20.context("--prod-code-20 is required")?,
            prod_code_30: self.prod_code_30.context("--prod-code-30 is required")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config = config::Config::load()?;
    let format = cli
        .format
        .or_else(|| {
            file_config
                .default_format
                .as_deref()
                .and_then(output::OutputFormat::from_name)
        })
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&file_config.api_url(cli.api_url.as_deref()))?;

    // Execute command
    let passed = match cli.command {
        Commands::Health => status::health(&client, format).await?,
        Commands::Ready => status::ready(&client, format).await?,
        Commands::Predict(args) => {
            predict::predict(&client, &args.into_request()?, format).await?;
            true
        }
        Commands::Batch { file } => {
            predict::batch(&client, &file, format).await?;
            true
        }
        Commands::Info => {
            model::info(&client, format).await?;
            true
        }
        Commands::Reload => {
            model::reload(&client, format).await?;
            true
        }
    };

    if !passed {
        output::print_error("Check failed");
        std::process::exit(1);
    }

    Ok(())
}
