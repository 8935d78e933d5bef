//! # Snapshot Module
//!
//! Typed device model and the snapshot builder.
//!
//! This module handles:
//! - Parsing the device-list payload into structured `Device` values
//! - Fetching the latest position/voltage record per device
//! - Assembling one immutable, internally consistent `Snapshot`
//!
//! A snapshot is never mutated after construction; the poller replaces it
//! wholesale on each successful refresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::validate::validate_envelope;
use crate::api::{ApiRequester, DEVICES_INFO_PATH};
use crate::error::{FleetPollError, Result};
use crate::extended::{fetch_extended, ExtendedQuery};

/// One tracked device, as reported by the device-list endpoint
///
/// Every field beyond `id` is optional: the server omits sections freely
/// depending on device model and subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub model: Option<DeviceModel>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub uniqueid: Option<String>,
    #[serde(default)]
    pub battery: Option<Battery>,
    #[serde(default)]
    pub ignition: Option<Ignition>,
    #[serde(default)]
    pub position_info: Option<PositionInfo>,
    #[serde(default)]
    pub speed: Option<Speed>,
    #[serde(default)]
    pub last_update: Option<String>,
}

/// Nested model descriptor (`model.model` holds the human-readable name)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceModel {
    #[serde(default)]
    pub model: Option<String>,
}

/// Battery section: internal charge plus external supply readings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battery {
    #[serde(default)]
    pub internal: Option<f64>,
    #[serde(default)]
    pub external_voltage: Option<f64>,
    /// Boolean-ish flag; some firmware revisions send 0/1
    #[serde(default)]
    pub external_power_supply: Option<Value>,
}

/// Ignition section with a boolean-ish value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ignition {
    #[serde(default)]
    pub value: Option<Value>,
}

/// Last known position embedded in the device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub datetime: Option<String>,
}

/// Speed section: current speed and the road's limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speed {
    #[serde(default)]
    pub current_speed: Option<SpeedValue>,
    #[serde(default)]
    pub speed_limit: Option<SpeedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedValue {
    #[serde(default)]
    pub value: Option<f64>,
}

impl Device {
    /// Case-insensitive check of the free-text `status` field
    pub fn is_online(&self) -> bool {
        self.status
            .as_deref()
            .map(|status| status.eq_ignore_ascii_case("online"))
            .unwrap_or(false)
    }

    pub fn external_power(&self) -> bool {
        self.battery
            .as_ref()
            .and_then(|battery| battery.external_power_supply.as_ref())
            .map(truthy)
            .unwrap_or(false)
    }

    pub fn ignition_on(&self) -> bool {
        self.ignition
            .as_ref()
            .and_then(|ignition| ignition.value.as_ref())
            .map(truthy)
            .unwrap_or(false)
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_ref().and_then(|model| model.model.as_deref())
    }
}

/// Truthiness across the value shapes the API uses for flags
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => {
            !text.is_empty() && !text.eq_ignore_ascii_case("false") && text != "0"
        }
        _ => false,
    }
}

/// Accept both `"123"` and `123` for identifier fields
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {}",
            other
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        Value::Number(number) => Ok(Some(number.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {}",
            other
        ))),
    }
}

/// Latest extended records for one device
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtendedBundle {
    /// Most recent position row, absent when the device reported none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_latest: Option<Value>,
    /// Most recent voltage row, absent when the device reported none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_latest: Option<Value>,
}

/// Immutable result of one refresh cycle
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    /// Raw device-list payload, as returned by the server
    pub devices_payload: Value,
    /// Parsed devices, API order preserved
    pub devices: Vec<Device>,
    /// Latest extended records keyed by device id; keys are always a subset
    /// of the device ids above
    pub extended: HashMap<String, ExtendedBundle>,
}

impl Snapshot {
    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == device_id)
    }

    pub fn extended_for(&self, device_id: &str) -> Option<&ExtendedBundle> {
        self.extended.get(device_id)
    }
}

/// Options for one snapshot build
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Fetch latest position/voltage records per device
    pub fetch_extended: bool,
    /// Pagination safety cap for the extended fetches
    pub max_pages: u32,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            fetch_extended: true,
            max_pages: crate::extended::DEFAULT_MAX_PAGES,
        }
    }
}

/// Build one snapshot: device list first, then per-device latest records
///
/// The device-list fetch completes before any extended fetch starts. The
/// per-device extended fetches then run concurrently, each writing its own
/// key of the result map. Any single failure aborts the whole build; the
/// caller decides whether to keep serving an older snapshot.
///
/// # Errors
///
/// Propagates the device-list fetch error, any extended-fetch error, and
/// duplicate device ids in the listing.
pub async fn build_snapshot(
    requester: Arc<dyn ApiRequester>,
    options: &SnapshotOptions,
) -> Result<Snapshot> {
    let payload = requester.get(DEVICES_INFO_PATH).await?;
    let envelope = validate_envelope(payload.clone())?;

    let devices = parse_devices(&envelope)?;
    debug!("device list: {} devices", devices.len());

    let mut extended: HashMap<String, ExtendedBundle> = HashMap::new();

    if options.fetch_extended {
        let mut fetches = tokio::task::JoinSet::new();

        for device in &devices {
            let requester = Arc::clone(&requester);
            let device_id = device.id.clone();
            let max_pages = options.max_pages;

            fetches.spawn(async move {
                let (position, voltage) = tokio::try_join!(
                    fetch_latest(requester.as_ref(), &device_id, "position", max_pages),
                    fetch_latest(requester.as_ref(), &device_id, "voltage", max_pages),
                )?;

                Ok::<_, FleetPollError>((
                    device_id,
                    ExtendedBundle {
                        position_latest: position,
                        voltage_latest: voltage,
                    },
                ))
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let (device_id, bundle) = joined
                .map_err(|error| FleetPollError::Snapshot(format!("extended fetch task failed: {}", error)))??;
            extended.insert(device_id, bundle);
        }
    }

    Ok(Snapshot {
        fetched_at: Utc::now(),
        devices_payload: payload,
        devices,
        extended,
    })
}

/// Extract and parse `data.devices`, defaulting to empty on odd shapes
///
/// Entries that fail to parse or lack a non-empty id are skipped with a
/// warning rather than failing the refresh; a duplicate id is an error
/// because it would corrupt the extended map's keying.
fn parse_devices(envelope: &serde_json::Map<String, Value>) -> Result<Vec<Device>> {
    let entries: &[Value] = match envelope.get("data").and_then(|data| data.get("devices")) {
        Some(Value::Array(entries)) => entries.as_slice(),
        _ => &[],
    };

    let mut devices = Vec::with_capacity(entries.len());
    let mut seen: HashSet<String> = HashSet::new();

    for entry in entries {
        let device: Device = match serde_json::from_value(entry.clone()) {
            Ok(device) => device,
            Err(error) => {
                warn!("skipping unparseable device entry: {}", error);
                continue;
            }
        };

        if device.id.trim().is_empty() {
            warn!("skipping device entry with empty id");
            continue;
        }
        if !seen.insert(device.id.clone()) {
            return Err(FleetPollError::Snapshot(format!(
                "duplicate device id in listing: {}",
                device.id
            )));
        }

        devices.push(device);
    }

    Ok(devices)
}

/// Fetch the most recent record of one type, `None` when the device has none
async fn fetch_latest(
    requester: &dyn ApiRequester,
    device_id: &str,
    telemetry_type: &str,
    max_pages: u32,
) -> Result<Option<Value>> {
    let mut query = ExtendedQuery::latest(device_id, telemetry_type);
    query.max_pages = max_pages;

    let fetch = fetch_extended(requester, &query).await?;
    Ok(fetch.rows.into_iter().next())
}
