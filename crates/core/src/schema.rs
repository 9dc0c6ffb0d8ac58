//! Minimal configuration schema checks.

use tracing::error;

/// True when `payload` is an object holding a non-null value for every key
/// in `required`. Each missing key is logged.
pub fn is_valid_configuration<S: AsRef<str>>(required: &[S], payload: &serde_json::Value) -> bool {
    let Some(object) = payload.as_object() else {
        error!(payload = %payload, "invalid configuration: expected an object");
        return false;
    };
    let mut valid = true;
    for key in required {
        let key = key.as_ref();
        match object.get(key) {
            Some(value) if !value.is_null() => {}
            _ => {
                error!(key, "invalid configuration: missing required key");
                valid = false;
            }
        }
    }
    valid
}
