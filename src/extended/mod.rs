//! # Extended Data Module
//!
//! Paginated retrieval of per-device telemetry ("extended" records).
//!
//! This module handles:
//! - Page-by-page POSTs to the extended endpoint for one (device, type) pair
//! - Defensive row extraction across the type-dependent payload shapes
//! - Stop conditions: row budget, empty page, server-reported page count
//! - A configurable page-count safety cap against misbehaving servers

use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::api::validate::validate_envelope;
use crate::api::{ApiRequester, DEVICE_EXTENDED_PATH};
use crate::error::{FleetPollError, Result};

/// Default page-count safety cap
///
/// The server is supposed to end pagination with an empty page or a
/// `total_pages` hint; this cap bounds the loop when it does neither.
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Row-extraction rules for known telemetry types
///
/// Maps a telemetry type to the field of the payload's `data` object that
/// holds its rows. Types not listed here fall back to the field named exactly
/// like the type, then to the type name with a trailing `s`.
const ROW_FIELDS: &[(&str, &str)] = &[
    ("position", "positions"),
    ("voltage", "voltage"),
];

/// Parameters for one (device, type) extended fetch
#[derive(Debug, Clone)]
pub struct ExtendedQuery {
    pub device_id: String,
    pub telemetry_type: String,
    /// ISO-8601 Z-suffixed window start, e.g. "2026-02-04T00:00:00Z"
    pub start: Option<String>,
    /// ISO-8601 Z-suffixed window stop
    pub stop: Option<String>,
    pub page_size: u32,
    pub max_rows: usize,
    pub max_pages: u32,
}

impl ExtendedQuery {
    /// Query for the single most recent record of a type
    ///
    /// The API returns newest rows first, so `pagesize = 1` on page 1 yields
    /// the latest sample without a time window.
    pub fn latest(device_id: &str, telemetry_type: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            telemetry_type: telemetry_type.to_string(),
            start: None,
            stop: None,
            page_size: 1,
            max_rows: 1,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Query for a time window of records
    pub fn windowed(
        device_id: &str,
        telemetry_type: &str,
        start: Option<String>,
        stop: Option<String>,
        page_size: u32,
        max_rows: usize,
        max_pages: u32,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            telemetry_type: telemetry_type.to_string(),
            start,
            stop,
            page_size,
            max_rows,
            max_pages,
        }
    }

    fn page_body(&self, page: u32) -> Value {
        let mut body = json!({
            "deviceid": self.device_id,
            "type": self.telemetry_type,
            "page": page,
            "pagesize": self.page_size,
        });
        if let Some(start) = &self.start {
            body["startdatetime"] = json!(start);
        }
        if let Some(stop) = &self.stop {
            body["stopdatetime"] = json!(stop);
        }
        body
    }
}

/// Result of one extended fetch
#[derive(Debug, Clone)]
pub struct ExtendedFetch {
    /// Accumulated rows across pages, original order preserved
    pub rows: Vec<Value>,
    /// The `meta` object of the last page, `{}` when absent
    pub last_meta: Value,
    /// Raw page payloads, kept for diagnostics dumps
    pub raw_pages: Vec<Value>,
}

/// Fetch extended records for one (device, type) pair, following pagination
///
/// Issues page 1 with the query's filters and keeps requesting pages until a
/// stop condition is met, checked in priority order after each page:
///
/// 1. Accumulated rows reach `max_rows`: truncate to exactly `max_rows`.
/// 2. The page returned zero rows.
/// 3. A pagination descriptor (top-level or under `data`) reports a
///    `total_pages` the current page has reached.
///
/// Exceeding `max_pages` without hitting a stop condition is an error.
///
/// # Errors
///
/// Propagates transport errors, API-error envelopes, and the page cap.
pub async fn fetch_extended(
    requester: &dyn ApiRequester,
    query: &ExtendedQuery,
) -> Result<ExtendedFetch> {
    let mut rows: Vec<Value> = Vec::new();
    let mut last_meta = json!({});
    let mut raw_pages: Vec<Value> = Vec::new();
    let mut page: u32 = 1;

    loop {
        let payload = requester.post(DEVICE_EXTENDED_PATH, query.page_body(page)).await?;
        raw_pages.push(payload.clone());

        let envelope = validate_envelope(payload)?;

        let page_rows = extract_rows(&envelope, &query.telemetry_type);
        trace!(
            "device {} type {} page {}: {} rows",
            query.device_id,
            query.telemetry_type,
            page,
            page_rows.len()
        );

        let page_was_empty = page_rows.is_empty();
        rows.extend(page_rows);

        if let Some(meta) = envelope.get("meta").filter(|meta| !meta.is_null()) {
            last_meta = meta.clone();
        }

        if rows.len() >= query.max_rows {
            rows.truncate(query.max_rows);
            break;
        }
        if page_was_empty {
            break;
        }
        if reached_last_page(&envelope, page) {
            break;
        }
        if page >= query.max_pages {
            return Err(FleetPollError::PageLimit {
                device_id: query.device_id.clone(),
                telemetry_type: query.telemetry_type.clone(),
                pages: page,
            });
        }

        page += 1;
    }

    debug!(
        "device {} type {}: fetched {} rows over {} pages",
        query.device_id,
        query.telemetry_type,
        rows.len(),
        raw_pages.len()
    );

    Ok(ExtendedFetch {
        rows,
        last_meta,
        raw_pages,
    })
}

/// Extract the row list from a validated page payload
///
/// The field holding the rows depends on the telemetry type (see
/// [`ROW_FIELDS`]). A missing or non-object `data` yields no rows; a lone
/// object where an array was expected is wrapped into a one-element list.
fn extract_rows(envelope: &Map<String, Value>, telemetry_type: &str) -> Vec<Value> {
    let data = match envelope.get("data") {
        Some(Value::Object(data)) => data,
        _ => return Vec::new(),
    };

    let raw = match ROW_FIELDS
        .iter()
        .find(|(name, _)| *name == telemetry_type)
    {
        Some((_, field)) => data.get(*field),
        None => {
            // Unknown type: literal field first, then trailing-s plural
            data.get(telemetry_type)
                .filter(|value| !value.is_null())
                .or_else(|| data.get(&format!("{}s", telemetry_type)))
        }
    };

    match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(rows)) => rows.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Check the server-reported pagination descriptor for the stop hint
///
/// The descriptor lives at the top level or nested under `data`, depending
/// on the endpoint version. Its `page` field is trusted when present, else
/// the request's page number is used.
fn reached_last_page(envelope: &Map<String, Value>, request_page: u32) -> bool {
    let pagination = envelope
        .get("pagination")
        .filter(|value| value.is_object())
        .or_else(|| {
            envelope
                .get("data")
                .and_then(|data| data.get("pagination"))
                .filter(|value| value.is_object())
        });

    let Some(pagination) = pagination else {
        return false;
    };
    let Some(total_pages) = pagination.get("total_pages").and_then(Value::as_u64) else {
        return false;
    };

    let current = pagination
        .get("page")
        .and_then(Value::as_u64)
        .unwrap_or(request_page as u64);

    current >= total_pages
}

/// Best-effort timestamp lookup across the known row schemas
///
/// Position rows carry `positiontime`, voltage rows `servertime`; other
/// types use assorted keys. Returns the first match.
pub fn row_timestamp(row: &Value) -> Option<&str> {
    const TIMESTAMP_KEYS: &[&str] = &["positiontime", "servertime", "datetime", "time", "timestamp"];

    TIMESTAMP_KEYS.iter().find_map(|key| {
        row.get(key)
            .and_then(Value::as_str)
            .filter(|timestamp| !timestamp.is_empty())
    })
}
