//! Prediction commands

use anyhow::{Context, Result};
use std::path::Path;
use tabled::Tabled;

use crate::client::{ApiClient, BatchResponse, PredictionRequest, PredictionResponse};
use crate::output::{color_class, format_probability, print_json, print_warning, OutputFormat};

/// Row for predictions table
#[derive(Tabled)]
struct PredictionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Prediction")]
    prediction: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Low")]
    low: String,
    #[tabled(rename = "Medium")]
    medium: String,
    #[tabled(rename = "High")]
    high: String,
    #[tabled(rename = "Model")]
    model: String,
}

impl PredictionRow {
    fn new(index: usize, response: &PredictionResponse) -> Self {
        let probability = |class: &str| {
            response
                .probability
                .get(class)
                .map(|p| format_probability(*p))
                .unwrap_or_else(|| "-".to_string())
        };
        Self {
            index,
            prediction: color_class(&response.prediction),
            confidence: format_probability(response.confidence),
            low: probability("Low"),
            medium: probability("Medium"),
            high: probability("High"),
            model: response.model_version.clone(),
        }
    }
}

fn print_rows(rows: Vec<PredictionRow>) {
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

/// Read a single request from a JSON file
pub fn read_request(path: &Path) -> Result<PredictionRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {:?}", path))?;
    serde_json::from_str(&content).context("Failed to parse request file")
}

/// Read a batch file: a JSON array of request objects.
///
/// Items are passed through untouched so the service reports any invalid
/// item by index.
pub fn read_batch(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {:?}", path))?;
    serde_json::from_str(&content).context("Batch file must contain a JSON array")
}

/// Score one request
pub async fn predict(
    client: &ApiClient,
    request: &PredictionRequest,
    format: OutputFormat,
) -> Result<()> {
    let response: PredictionResponse = client.post("predict", request).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => print_rows(vec![PredictionRow::new(0, &response)]),
    }

    Ok(())
}

/// Score a batch file
pub async fn batch(client: &ApiClient, path: &Path, format: OutputFormat) -> Result<()> {
    let items = read_batch(path)?;
    let result: BatchResponse = client.post("predict/batch", &items).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            if result.predictions.is_empty() {
                print_warning("Batch was empty");
                return Ok(());
            }

            let rows = result
                .predictions
                .iter()
                .enumerate()
                .map(|(i, p)| PredictionRow::new(i, p))
                .collect();
            print_rows(rows);
            println!("\nTotal: {} predictions", result.count);
        }
    }

    Ok(())
}
