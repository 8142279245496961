//! Duration parsing.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)?\s*$").unwrap());

/// Parse `500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let caps = DURATION_REGEX
        .captures(input)
        .ok_or_else(|| format!("invalid duration `{input}`"))?;
    let out_of_range = || format!("duration out of range `{input}`");
    let amount: u64 = caps[1].parse().map_err(|_| out_of_range())?;

    let duration = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(amount),
        Some("m") => Duration::from_secs(amount.checked_mul(60).ok_or_else(out_of_range)?),
        Some("h") => Duration::from_secs(amount.checked_mul(3600).ok_or_else(out_of_range)?),
        _ => Duration::from_secs(amount),
    };
    Ok(duration)
}
