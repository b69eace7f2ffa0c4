use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Storage format for timestamps in the relational store
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage format for times of day in the relational store
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Parses a date in strict `YYYY-MM-DD` form.
/// Rejects single-digit months/days and anything chrono would otherwise tolerate.
pub fn parse_strict_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 3 || parts[0].len() != 4 || parts[1].len() != 2 || parts[2].len() != 2 {
        return None;
    }
    if !parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// Parses a base-10 integer with no fraction, exponent or thousands separator
pub fn parse_integer(value: &str) -> Result<i64, String> {
    let value = value.trim();
    let digits = value.strip_prefix('-').unwrap_or(value);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{}' is not an integer", value));
    }
    value
        .parse::<i64>()
        .map_err(|_| format!("'{}' is out of range for a 64-bit integer", value))
}

/// Parses an integer and checks it lies within `min..=max`
pub fn parse_bounded(value: &str, min: i64, max: i64) -> Result<i64, String> {
    let parsed = parse_integer(value)?;
    if parsed < min || parsed > max {
        return Err(format!("{} is outside the range {}..={}", parsed, min, max));
    }
    Ok(parsed)
}

/// Parses a finite floating point number
pub fn parse_float(value: &str) -> Result<f64, String> {
    let value = value.trim();
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        _ => Err(format!("'{}' is not a finite number", value)),
    }
}

/// Parses a time of day as `HH:MM` or `HH:MM:SS`
pub fn parse_time(value: &str) -> Result<NaiveTime, String> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| format!("'{}' is not a time of day (HH:MM)", value))
}

/// Splits a `(latitude, longitude)` pair and validates both ranges
pub fn parse_coordinates(value: &str) -> Result<(f64, f64), String> {
    let inner = value
        .trim()
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| format!("'{}' is not a (latitude, longitude) pair", value))?;

    let (lat, lng) = inner
        .split_once(',')
        .ok_or_else(|| format!("'{}' is not a (latitude, longitude) pair", value))?;

    let latitude = parse_float(lat)?;
    let longitude = parse_float(lng)?;
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(format!("latitude {} is outside -90..=90", latitude));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("longitude {} is outside -180..=180", longitude));
    }
    Ok((latitude, longitude))
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()
}
