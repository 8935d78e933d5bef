//! Response envelope validation.
//!
//! The API reports failures in-band: a 2xx response can still carry
//! `{"success": false, "error": "..."}`. The HTTP layer rejects non-2xx
//! statuses before this check runs; both layers fail closed independently.

use serde_json::{Map, Value};

use crate::error::{FleetPollError, Result};

/// Classify a decoded response and yield its payload object
///
/// Rules, in order:
/// 1. A non-object value is malformed.
/// 2. An object with `success` explicitly `false` is an API error; the
///    `error` field supplies the message when present, else the whole
///    payload is stringified.
/// 3. Anything else is a success.
pub fn validate_envelope(payload: Value) -> Result<Map<String, Value>> {
    let object = match payload {
        Value::Object(object) => object,
        other => {
            return Err(FleetPollError::Malformed(format!(
                "expected a JSON object, got: {}",
                other
            )))
        }
    };

    if object.get("success") == Some(&Value::Bool(false)) {
        let message = match object.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(detail) => detail.to_string(),
            None => Value::Object(object).to_string(),
        };
        return Err(FleetPollError::Api(message));
    }

    Ok(object)
}
