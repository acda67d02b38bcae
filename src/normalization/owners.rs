/// Largest value storable in the INTEGER `estimated_owners` column.
pub const OWNERS_MAX: i64 = i32::MAX as i64;

/// Extract the lower-bound estimate from an owners range string.
///
/// SteamSpy reports ownership as a range like `"10,000,000 .. 20,000,000"`.
/// The lower bound is what the cleaned table keeps: thousands separators are
/// stripped, everything after the first `..` is ignored, and the result is
/// clamped to `OWNERS_MAX`.
///
/// Returns `None` for absent, empty, or non-numeric input.
pub fn parse_owners_lower_bound(raw: Option<&str>) -> Option<i32> {
    let raw = raw?;
    let lower = raw.replace(',', "");
    let lower = lower.split("..").next().unwrap_or("").trim();
    if lower.is_empty() {
        return None;
    }
    match lower.parse::<i64>() {
        Ok(n) => Some(n.min(OWNERS_MAX) as i32),
        Err(_) => None,
    }
}
