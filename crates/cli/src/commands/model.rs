//! Model management commands

use anyhow::Result;
use colored::Colorize;

use crate::client::{ApiClient, ModelInfo};
use crate::output::{
    color_status, format_bytes, print_info, print_json, print_success, print_warning, OutputFormat,
};

fn print_model_info(info: &ModelInfo) {
    println!("{}", "Model".bold());
    println!("{}", "=".repeat(60));
    println!("Loaded:     {}", info.loaded);
    println!("Version:    {}", info.version.cyan());
    if let Some(source) = &info.source {
        println!("Source:     {}", color_status(source));
    }
    println!("Location:   s3://{}/{}", info.bucket, info.key);
    println!("Cache:      {}", info.local_path);
    if let Some(size) = info.model_size_bytes {
        println!("Size:       {}", format_bytes(size));
    }
    if let Some(checksum) = &info.checksum {
        println!("SHA-256:    {}", checksum);
    }
    if let Some(loaded_at) = &info.loaded_at {
        println!("Loaded at:  {}", loaded_at);
    }
    if let Some(error) = &info.last_error {
        println!();
        print_warning(&format!("Last load error: {}", error));
    }
}

/// Show the active model
pub async fn info(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let info: ModelInfo = client.get("model/info").await?;

    match format {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Table => {
            if !info.loaded {
                print_info("No model loaded yet; the first prediction triggers a load");
            }
            print_model_info(&info);
        }
    }

    Ok(())
}

/// Force the service to refetch its model
pub async fn reload(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let info: ModelInfo = client.post("model/reload", &serde_json::json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Table => {
            match info.source.as_deref() {
                Some("fallback") => print_warning("Reload finished on the fallback model"),
                _ => print_success(&format!("Reloaded model {}", info.version)),
            }
            print_model_info(&info);
        }
    }

    Ok(())
}
