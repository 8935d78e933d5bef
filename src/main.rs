//! # Fleet Poll
//!
//! Poll a fleet-tracking REST API and expose normalized device snapshots.
//!
//! One-shot mode (the default) fetches the device list plus a time window of
//! extended telemetry per device and type, prints a per-device summary, and
//! optionally dumps the combined result and the raw API pages as JSON.
//! `--watch` mode runs the refresh scheduler instead, logging each cycle
//! until Ctrl+C.

use anyhow::{Context, Result};
use chrono::{Duration as TimeDelta, SecondsFormat, Utc};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use fleet_poll::api::{ApiRequester, CloudApiClient};
use fleet_poll::config::Config;
use fleet_poll::extended::{fetch_extended, row_timestamp, ExtendedQuery};
use fleet_poll::poller::Poller;
use fleet_poll::snapshot::{build_snapshot, Device, SnapshotOptions};

/// Telemetry types queried when `--types` is not given
const DEFAULT_TYPES: &str = "position,voltage,temp,humidity";

#[derive(Parser, Debug)]
#[command(name = "fleet-poll", version, about = "Fetch fleet-tracker devices and telemetry")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the API base URL from the config
    #[arg(long)]
    base_url: Option<String>,

    /// Comma-separated telemetry types to fetch
    #[arg(long, default_value = DEFAULT_TYPES)]
    types: String,

    /// Time window in hours back from now
    #[arg(long, default_value_t = 24)]
    hours: i64,

    /// Explicit ISO-8601 window start, e.g. 2026-02-04T00:00:00Z
    #[arg(long)]
    start: Option<String>,

    /// Explicit ISO-8601 window stop
    #[arg(long)]
    stop: Option<String>,

    /// Pagination page size
    #[arg(long)]
    pagesize: Option<u32>,

    /// Max rows per (device, type)
    #[arg(long)]
    max_rows: Option<usize>,

    /// Per-request HTTP timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Write the combined output to this JSON file
    #[arg(long)]
    dump_json: Option<PathBuf>,

    /// Write the raw API responses (devices + extended pages) to this JSON file
    #[arg(long)]
    dump_raw: Option<PathBuf>,

    /// Keep polling on the configured interval instead of a one-shot fetch
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Fleet Poll v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.api.timeout_s = timeout;
    }
    if let Some(pagesize) = cli.pagesize {
        config.poll.page_size = pagesize;
    }
    if let Some(max_rows) = cli.max_rows {
        config.poll.max_rows = max_rows;
    }
    config.validate()?;

    let client = CloudApiClient::new(
        &config.api.base_url,
        &config.api.bearer_token,
        Duration::from_secs(config.api.timeout_s),
    )?;
    let requester: Arc<dyn ApiRequester> = Arc::new(client);

    if cli.watch {
        run_watch(requester, config).await
    } else {
        run_once(requester, &cli, &config).await
    }
}

/// Run the refresh scheduler until Ctrl+C
async fn run_watch(requester: Arc<dyn ApiRequester>, config: Config) -> Result<()> {
    let poller = Poller::start(requester, config.poll.clone()).await?;
    let mut updates = poller.subscribe();

    info!(
        "Polling every {}s; press Ctrl+C to exit",
        config.poll.scan_interval_s
    );

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                info!(
                    "Refreshed at {}: {} devices, {} with extended data",
                    snapshot.fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    snapshot.devices.len(),
                    snapshot.extended.len()
                );
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    poller.shutdown().await;
    Ok(())
}

/// One-shot fetch: devices, then a window of each telemetry type per device
async fn run_once(requester: Arc<dyn ApiRequester>, cli: &Cli, config: &Config) -> Result<()> {
    let (start, stop) = resolve_window(cli.hours, cli.start.clone(), cli.stop.clone());
    let types = parse_types(&cli.types);

    // Device list only; windowed extended fetches follow per type below.
    let options = SnapshotOptions {
        fetch_extended: false,
        max_pages: config.poll.max_pages,
    };
    let snapshot = build_snapshot(Arc::clone(&requester), &options).await?;

    let mut combined_devices: Vec<Value> = Vec::new();
    let mut raw_extended: Vec<Value> = Vec::new();

    for device in &snapshot.devices {
        print_device_header(device);

        let mut extended_out = serde_json::Map::new();

        for telemetry_type in &types {
            let query = ExtendedQuery::windowed(
                &device.id,
                telemetry_type,
                start.clone(),
                stop.clone(),
                config.poll.page_size,
                config.poll.max_rows,
                config.poll.max_pages,
            );

            match fetch_extended(requester.as_ref(), &query).await {
                Ok(fetch) => {
                    print_type_summary(telemetry_type, &fetch.rows);
                    raw_extended.push(json!({
                        "device_id": device.id,
                        "device_name": device.name,
                        "type": telemetry_type,
                        "pages": fetch.raw_pages,
                    }));
                    extended_out.insert(
                        telemetry_type.clone(),
                        json!({"rows": fetch.rows, "meta": fetch.last_meta}),
                    );
                }
                // A failing type on one device should not sink the report;
                // the error is recorded in its place.
                Err(error) => {
                    println!("  {:<8}: ERROR: {}", telemetry_type, error);
                    extended_out.insert(
                        telemetry_type.clone(),
                        json!({"error": error.to_string(), "rows": []}),
                    );
                }
            }
        }

        combined_devices.push(json!({
            "id": device.id,
            "name": device.name,
            "model": device.model_name(),
            "status": device.status,
            "extended": extended_out,
        }));
    }

    if let Some(path) = &cli.dump_json {
        let combined = json!({
            "generated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "window": {"startdatetime": start, "stopdatetime": stop},
            "devices": combined_devices,
        });
        std::fs::write(path, serde_json::to_string_pretty(&combined)?)?;
        println!("\nWrote: {}", path.display());
    }

    if let Some(path) = &cli.dump_raw {
        let raw = json!({
            "devices_info": snapshot.devices_payload,
            "device_info_extended": raw_extended,
        });
        std::fs::write(path, serde_json::to_string_pretty(&raw)?)?;
        println!("Wrote raw API dump: {}", path.display());
    }

    Ok(())
}

/// Resolve the fetch window: explicit bounds win, else `hours` back from now
fn resolve_window(
    hours: i64,
    start: Option<String>,
    stop: Option<String>,
) -> (Option<String>, Option<String>) {
    if start.is_some() || stop.is_some() {
        return (start, stop);
    }

    let now = Utc::now();
    let start = (now - TimeDelta::hours(hours)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let stop = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    (Some(start), Some(stop))
}

fn parse_types(types: &str) -> Vec<String> {
    types
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_device_header(device: &Device) {
    println!(
        "\n== {} ({}) id={} status={} ==",
        device.name.as_deref().unwrap_or("-"),
        device.model_name().unwrap_or("-"),
        device.id,
        device.status.as_deref().unwrap_or("-"),
    );
}

/// One summary line per type: row count, last timestamp, headline fields
fn print_type_summary(telemetry_type: &str, rows: &[Value]) {
    let Some(last) = rows.last() else {
        println!(
            "  {:<8}:    0 rows (no data in window or unsupported on this device)",
            telemetry_type
        );
        return;
    };

    let timestamp = row_timestamp(last).unwrap_or("-");

    if last.get("latitude").is_some() || last.get("longitude").is_some() {
        println!(
            "  {:<8}: {:>4} rows | last={} | lat={} lon={} speed={}",
            telemetry_type,
            rows.len(),
            timestamp,
            fmt_field(last.get("latitude")),
            fmt_field(last.get("longitude")),
            fmt_field(row_speed(last)),
        );
    } else {
        println!(
            "  {:<8}: {:>4} rows | last={} | value={}",
            telemetry_type,
            rows.len(),
            timestamp,
            fmt_field(row_value(last)),
        );
    }
}

/// Speed of a position-shaped row; tolerates the unit-keyed object form
fn row_speed(row: &Value) -> Option<&Value> {
    let speed = row.get("speed").or_else(|| row.get("current_speed"))?;
    if speed.is_object() {
        return ["kmh", "mph", "knot"]
            .iter()
            .find_map(|unit| speed.get(unit));
    }
    Some(speed)
}

/// Headline reading of a non-position row, trying the likely keys
fn row_value(row: &Value) -> Option<&Value> {
    ["value", "voltage", "temp", "temperature", "humidity"]
        .iter()
        .find_map(|key| row.get(key))
}

fn fmt_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types_trims_and_drops_empties() {
        assert_eq!(
            parse_types(" position, voltage ,,temp"),
            vec!["position", "voltage", "temp"]
        );
        assert!(parse_types("").is_empty());
    }

    #[test]
    fn test_default_types_cover_known_and_future() {
        let types = parse_types(DEFAULT_TYPES);
        assert_eq!(types, vec!["position", "voltage", "temp", "humidity"]);
    }

    #[test]
    fn test_explicit_window_bounds_win() {
        let (start, stop) = resolve_window(
            24,
            Some("2026-02-04T00:00:00Z".to_string()),
            None,
        );
        assert_eq!(start.as_deref(), Some("2026-02-04T00:00:00Z"));
        assert_eq!(stop, None);
    }

    #[test]
    fn test_derived_window_is_z_suffixed() {
        let (start, stop) = resolve_window(6, None, None);
        assert!(start.unwrap().ends_with('Z'));
        assert!(stop.unwrap().ends_with('Z'));
    }

    #[test]
    fn test_row_speed_unit_object() {
        let row = serde_json::json!({"speed": {"kmh": 43.0, "mph": 26.7}});
        assert_eq!(row_speed(&row), Some(&serde_json::json!(43.0)));

        let row = serde_json::json!({"current_speed": 12});
        assert_eq!(row_speed(&row), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_fmt_field() {
        assert_eq!(fmt_field(None), "-");
        assert_eq!(fmt_field(Some(&serde_json::json!(null))), "-");
        assert_eq!(fmt_field(Some(&serde_json::json!("abc"))), "abc");
        assert_eq!(fmt_field(Some(&serde_json::json!(12.5))), "12.5");
    }
}
