use serde_json::Value;

use super::value::coerce_float;

/// Below this magnitude a price is assumed to already be in major currency
/// units (dollars); at or above it, minor units (cents).
const MINOR_UNIT_THRESHOLD: f64 = 1000.0;

/// Normalize an upstream price to major currency units (USD).
///
/// SteamSpy and the Steam store disagree on units: one sends `"1999"`
/// (cents, as a string), the other a decimal already in dollars. There is no
/// unit marker in either payload, so this applies the threshold heuristic the
/// pipeline has always used: values under 1000 pass through unchanged,
/// anything else is divided by 100 and rounded to two decimals. A legitimate
/// major-unit price of 1000 or more would be mis-scaled here.
///
/// Returns `None` for absent or non-numeric input.
pub fn normalize_price_to_major_units(value: &Value) -> Option<f64> {
    let price = coerce_float(value, None)?;
    if price.abs() < MINOR_UNIT_THRESHOLD {
        return Some(price);
    }
    let dollars = price / 100.0;
    Some((dollars * 100.0).round() / 100.0)
}
