//! Health and readiness checks
//!
//! Both commands report whether the check passed so the binary can exit
//! non-zero, which makes `ppctl health` usable as a container health check.

use anyhow::Result;
use colored::Colorize;

use crate::client::{ApiClient, HealthResponse, ReadinessResponse};
use crate::output::{color_status, print_json, OutputFormat};

/// Check service health; returns true when the service reports `healthy`
pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<bool> {
    let (_, health): (u16, HealthResponse) = client.get_status("health").await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("{}", "Service Health".bold());
            println!("{}", "=".repeat(40));
            println!("Status:        {}", color_status(&health.status));
            println!("Model loaded:  {}", health.model_loaded);
            println!("Model version: {}", health.model_version.cyan());
            if let Some(source) = &health.model_source {
                println!("Model source:  {}", color_status(source));
            }
        }
    }

    Ok(health.is_healthy())
}

/// Check readiness; returns true when the service accepts traffic
pub async fn ready(client: &ApiClient, format: OutputFormat) -> Result<bool> {
    let (status, readiness): (u16, ReadinessResponse) = client.get_status("ready").await?;

    match format {
        OutputFormat::Json => print_json(&readiness)?,
        OutputFormat::Table => {
            print!("{}", color_status(&readiness.status));
            match &readiness.reason {
                Some(reason) => println!(" ({})", reason),
                None => println!(),
            }
        }
    }

    Ok(status == 200 && readiness.status == "ready")
}
