//! Timestamp normalization.
//!
//! Windows SystemTime strings carry 7-digit fractional seconds
//! (100 ns units), e.g. `2026-02-21T16:42:04.7999016Z`. chrono parses
//! at most 9 fractional digits but formats at most 9 as nanoseconds;
//! to guarantee the original precision survives exactly, the fraction
//! is split off before parsing and re-attached verbatim after the
//! timezone conversion.

use chrono::{Local, NaiveDateTime, TimeZone, Utc};

/// Convert a Windows SystemTime UTC string to the host's local civil
/// time, preserving the original fractional digits exactly.
///
/// Input:  `2026-02-21T16:42:04.7999016Z`
/// Output: `2026-02-21T22:12:04.7999016` (for UTC+5:30)
///
/// Returns the input unchanged if it does not parse; a malformed
/// timestamp is still a usable opaque value downstream.
pub fn utc_to_local(raw_utc: &str) -> String {
    match convert(raw_utc) {
        Some(local) => local,
        None => raw_utc.to_string(),
    }
}

fn convert(raw_utc: &str) -> Option<String> {
    let clean = raw_utc.strip_suffix('Z').unwrap_or(raw_utc);

    let (date_part, frac) = match clean.split_once('.') {
        Some((d, f)) if !f.is_empty() => (d, f),
        _ => (clean, "0"),
    };

    let seconds = NaiveDateTime::parse_from_str(date_part, "%Y-%m-%dT%H:%M:%S").ok()?;
    let local = Utc.from_utc_datetime(&seconds).with_timezone(&Local);

    Some(format!("{}.{}", local.format("%Y-%m-%dT%H:%M:%S"), frac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seven_digit_fraction_preserved() {
        let out = utc_to_local("2026-02-21T16:42:04.7999016Z");
        assert!(
            out.ends_with(".7999016"),
            "fraction must survive verbatim, got {}",
            out
        );
        // Shape: date T time . fraction, no trailing Z.
        assert!(!out.ends_with('Z'));
        assert_eq!(out.len(), "2026-02-21T16:42:04.7999016".len());
    }

    #[test]
    fn test_missing_fraction_gets_zero() {
        let out = utc_to_local("2026-02-21T16:42:04Z");
        assert!(out.ends_with(".0"), "got {}", out);
    }

    #[test]
    fn test_unparseable_input_passes_through() {
        assert_eq!(utc_to_local("garbage"), "garbage");
        assert_eq!(utc_to_local(""), "");
    }

    #[test]
    fn test_conversion_matches_chrono_offset() {
        // The date/time part must equal chrono's own conversion of the
        // same instant, whatever timezone the test host runs in.
        let out = utc_to_local("2026-02-21T16:42:04.5Z");
        let expected = Utc
            .with_ymd_and_hms(2026, 2, 21, 16, 42, 4)
            .unwrap()
            .with_timezone(&Local)
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        assert_eq!(out, format!("{}.5", expected));
    }
}
