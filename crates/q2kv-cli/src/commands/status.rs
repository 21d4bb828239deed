//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health report served by a running sink.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    running: bool,
    uptime_seconds: Option<u64>,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// Metrics shown by the status command, in display order.
const DISPLAYED_METRICS: [(&str, &str); 7] = [
    ("q2kv_event_drain_success_total", "Events Committed:"),
    ("q2kv_mutations_submitted_total", "Mutations Written:"),
    ("q2kv_batch_complete_total", "Full Batches:"),
    ("q2kv_batch_underflow_total", "Partial Batches:"),
    ("q2kv_batch_empty_total", "Empty Polls:"),
    ("q2kv_rollbacks_total", "Rollbacks:"),
    ("q2kv_errors_total", "Errors:"),
];

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the q2kv sink running?");
            println!("Start it with: q2kv ingest --config <path-to-config> --input <events.jsonl>");
            return Ok(());
        }
    }

    let metrics_url = metrics_url(url);
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

/// Metrics endpoint next to a health URL on the default ports.
fn metrics_url(health_url: &str) -> String {
    let base = health_url
        .trim_end_matches('/')
        .trim_end_matches("/health")
        .replace(":8080", ":9090");
    format!("{}/metrics", base)
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    match (health.running, health.uptime_seconds) {
        (true, Some(uptime)) => println!("Sink running for {}s", uptime),
        (true, None) => println!("Sink running"),
        (false, _) => println!("Sink not running"),
    }
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            match &status.reason {
                Some(reason) => println!("  {} {}: {} ({})", tag, name, status.status, reason),
                None => println!("  {} {}: {}", tag, name, status.status),
            }
        }
    }
}

/// Unlabelled sample values from Prometheus text.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, u64> {
    metrics_text
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((name, value))
        })
        .collect()
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    for (name, label) in DISPLAYED_METRICS {
        if let Some(v) = values.get(name) {
            println!("{:<19} {}", label, format_number(*v));
        }
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
