//! Human-readable duration and byte-size parsing/formatting.
//!
//! Durations accept one or more `<number><suffix>` groups (`90s`, `1h30m`,
//! `7d`). The suffix set intentionally includes calendar-ish units with fixed
//! conversions: `mo` = 30 days, `y` = 365 days.

use std::time::Duration;

/// Parse a human duration string such as `30s`, `5m`, `1h30m`, `7d`, `1mo`.
///
/// Bare numbers are seconds. Unknown suffixes and empty input are errors.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    // Bare integer means seconds.
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit suffix in '{input}'"))?;
        if digits_end == 0 {
            return Err(format!("expected number in '{input}' at '{rest}'"));
        }
        let (number_str, tail) = rest.split_at(digits_end);
        let value: f64 = number_str
            .parse()
            .map_err(|_| format!("invalid number '{number_str}' in '{input}'"))?;

        let suffix_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (suffix, remaining) = tail.split_at(suffix_end);
        rest = remaining;

        total += unit_duration(suffix.trim(), value)
            .ok_or_else(|| format!("unknown duration unit '{suffix}' in '{input}'"))?;
    }

    Ok(total)
}

fn unit_duration(suffix: &str, value: f64) -> Option<Duration> {
    let nanos_per: f64 = match suffix.to_ascii_lowercase().as_str() {
        "ns" => 1.0,
        "us" | "µs" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" | "sec" | "second" | "seconds" => 1e9,
        "m" | "min" | "minute" | "minutes" => 60.0 * 1e9,
        "h" | "hr" | "hour" | "hours" => 3_600.0 * 1e9,
        "d" | "day" | "days" => 86_400.0 * 1e9,
        "w" | "wk" | "week" | "weeks" => 7.0 * 86_400.0 * 1e9,
        "mo" | "month" | "months" => 30.0 * 86_400.0 * 1e9,
        "y" | "yr" | "year" | "years" => 365.0 * 86_400.0 * 1e9,
        _ => return None,
    };
    Some(Duration::from_nanos((value * nanos_per) as u64))
}

/// Parse a byte size such as `512`, `64KB`, `100MB`, `2GB`.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }
    if let Ok(plain) = trimmed.parse::<u64>() {
        return Ok(plain);
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("missing unit in '{input}'"))?;
    let (number_str, suffix) = trimmed.split_at(digits_end);
    let value: f64 = number_str
        .parse()
        .map_err(|_| format!("invalid number '{number_str}' in '{input}'"))?;

    let multiplier: f64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("unknown size unit '{other}' in '{input}'")),
    };

    Ok((value * multiplier) as u64)
}

/// Format a byte count with the closest binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= THRESHOLD && unit < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit += 1;
    }

    if unit == 0 {
        format!("{size:.0}{}", UNITS[unit])
    } else if size >= 10.0 {
        format!("{size:.1}{}", UNITS[unit])
    } else {
        format!("{size:.2}{}", UNITS[unit])
    }
}

/// Format a duration compactly (`500ms`, `1.50s`, `1m30s`, `1h1m`).
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return "0ms".to_string();
    }

    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        let seconds = millis as f64 / 1000.0;
        if seconds >= 10.0 {
            format!("{seconds:.1}s")
        } else {
            format!("{seconds:.2}s")
        }
    } else if millis < 3_600_000 {
        let total = millis / 1000;
        let minutes = total / 60;
        let seconds = total % 60;
        if seconds == 0 {
            format!("{minutes}m")
        } else {
            format!("{minutes}m{seconds}s")
        }
    } else {
        let total = millis / 1000;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        if minutes == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h{minutes}m")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_documented_suffix() {
        assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
        assert_eq!(parse_duration("5us").unwrap(), Duration::from_micros(5));
        assert_eq!(parse_duration("5µs").unwrap(), Duration::from_micros(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2sec").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2hr").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("1mo").unwrap(), Duration::from_secs(30 * 86_400));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(365 * 86_400));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_unknown_units() {
        assert!(parse_duration("5parsecs").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn parses_byte_sizes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("512B").unwrap(), 512);
        assert_eq!(parse_bytes("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_bytes("100MB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_bytes("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_bytes("9PB").is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.0MB");
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3660)), "1h1m");
    }
}
