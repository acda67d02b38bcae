use serde_json::Value;

/// Best-effort integer coercion from a loosely-typed JSON value.
///
/// Upstream payloads mix numbers and numeric strings for the same field
/// between responses, so every numeric field goes through here before it is
/// bound to a typed column or placed in a cleaned record. Floats truncate
/// toward zero. Falls back to `default` (which may itself be `None`) on
/// anything unparseable.
pub fn coerce_int(value: &Value, default: Option<i64>) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .or(default),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .or(default)
        }
        Value::Bool(b) => Some(*b as i64),
        _ => default,
    }
}

/// Float counterpart of [`coerce_int`].
pub fn coerce_float(value: &Value, default: Option<f64>) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().or(default),
        Value::String(s) => s.trim().parse::<f64>().ok().or(default),
        _ => default,
    }
}
