//! # Special Dates
//!
//! Relative timestamp placeholders usable wherever a timestamp is:
//! `$now`, `$today`, `$yesterday`, `$tomorrow` and `$<N><unit>ago`.
//!
//! | unit | meaning |
//! |------|---------|
//! | `S`  | seconds |
//! | `m`  | minutes |
//! | `H`  | hours   |
//! | `d`  | days    |
//! | `w`  | weeks   |
//! | `M`  | months  |
//! | `y`  | years   |

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use regex::Regex;

use super::errors::{FilterError, FilterResult};

fn ago_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\$(\d+)([A-Za-z])ago$").expect("valid regex"))
}

/// Resolve `text` against `now`. `Ok(None)` when it is not a placeholder.
pub fn resolve(text: &str, now: DateTime<Utc>) -> FilterResult<Option<DateTime<Utc>>> {
    if !text.starts_with('$') {
        return Ok(None);
    }
    match text {
        "$now" => return Ok(Some(now)),
        "$today" => return start_of_day(now).map(Some),
        "$yesterday" => return Ok(Some(start_of_day(now)? - Duration::days(1))),
        "$tomorrow" => return Ok(Some(start_of_day(now)? + Duration::days(1))),
        _ => {}
    }

    let Some(captures) = ago_pattern().captures(text) else {
        return Ok(None);
    };
    let amount: u32 = captures[1]
        .parse()
        .map_err(|_| FilterError::invalid(format!("date offset out of range in {text}")))?;
    if amount == 0 {
        return Err(FilterError::invalid(format!("date offset must be positive in {text}")));
    }

    let shifted = match &captures[2] {
        "S" => now.checked_sub_signed(Duration::seconds(i64::from(amount))),
        "m" => now.checked_sub_signed(Duration::minutes(i64::from(amount))),
        "H" => now.checked_sub_signed(Duration::hours(i64::from(amount))),
        "d" => now.checked_sub_signed(Duration::days(i64::from(amount))),
        "w" => now.checked_sub_signed(Duration::weeks(i64::from(amount))),
        "M" => now.checked_sub_months(Months::new(amount)),
        "y" => amount
            .checked_mul(12)
            .and_then(|months| now.checked_sub_months(Months::new(months))),
        unit => {
            return Err(FilterError::invalid(format!(
                "unknown date unit {unit} in {text}"
            )))
        }
    };
    shifted
        .map(Some)
        .ok_or_else(|| FilterError::invalid(format!("date offset out of range in {text}")))
}

fn start_of_day(now: DateTime<Utc>) -> FilterResult<DateTime<Utc>> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| FilterError::invalid("cannot compute start of day"))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(iso: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(iso).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_named_placeholders() {
        let now = at("2024-03-15T13:45:10Z");
        assert_eq!(resolve("$now", now).unwrap(), Some(now));
        assert_eq!(resolve("$today", now).unwrap(), Some(at("2024-03-15T00:00:00Z")));
        assert_eq!(
            resolve("$yesterday", now).unwrap(),
            Some(at("2024-03-14T00:00:00Z"))
        );
        assert_eq!(
            resolve("$tomorrow", now).unwrap(),
            Some(at("2024-03-16T00:00:00Z"))
        );
    }

    #[test]
    fn test_relative_units() {
        let now = at("2024-03-15T13:45:10Z");
        assert_eq!(resolve("$15Sago", now).unwrap(), Some(at("2024-03-15T13:44:55Z")));
        assert_eq!(resolve("$2mago", now).unwrap(), Some(at("2024-03-15T13:43:10Z")));
        assert_eq!(resolve("$3Hago", now).unwrap(), Some(at("2024-03-15T10:45:10Z")));
        assert_eq!(resolve("$1dago", now).unwrap(), Some(at("2024-03-14T13:45:10Z")));
        assert_eq!(resolve("$1wago", now).unwrap(), Some(at("2024-03-08T13:45:10Z")));
        assert_eq!(resolve("$1Mago", now).unwrap(), Some(at("2024-02-15T13:45:10Z")));
        assert_eq!(resolve("$1yago", now).unwrap(), Some(at("2023-03-15T13:45:10Z")));
    }

    #[test]
    fn test_unknown_unit_is_invalid() {
        let now = Utc::now();
        assert!(matches!(resolve("$5Qago", now), Err(FilterError::Invalid(_))));
        assert!(matches!(resolve("$0dago", now), Err(FilterError::Invalid(_))));
    }

    #[test]
    fn test_non_placeholders_pass_through() {
        let now = Utc::now();
        assert_eq!(resolve("hello", now).unwrap(), None);
        assert_eq!(resolve("$regex", now).unwrap(), None);
        assert_eq!(resolve("$15Sagone", now).unwrap(), None);
    }
}
