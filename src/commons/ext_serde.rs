//! Helper functions for serializing and deserializing external types.

use std::str::FromStr;
use std::time::Duration;
use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};


//------------ Duration ------------------------------------------------------

/// Parses a duration such as `72h`, `1h30m`, `90s` or `500ms`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string())
    }
    if let Ok(secs) = u64::from_str(s) {
        return Ok(Duration::from_secs(secs))
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{}'", s))
        }
        let value = u64::from_str(&rest[..digits])
            .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
        rest = &rest[digits..];

        let unit = rest.find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit] {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            other => {
                return Err(format!(
                    "invalid unit '{}' in duration '{}'", other, s
                ))
            }
        };
        total += part;
        rest = &rest[unit..];
    }
    Ok(total)
}

/// Formats a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_nanos() != 0 {
        format!("{}ms", d.as_millis())
    }
    else if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    }
    else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    }
    else {
        format!("{}s", secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Secs(u64),
    Text(String),
}

pub fn de_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationRepr::deserialize(d)? {
        DurationRepr::Secs(secs) => Ok(Duration::from_secs(secs)),
        DurationRepr::Text(text) => {
            parse_duration(&text).map_err(de::Error::custom)
        }
    }
}

pub fn ser_duration<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    format_duration(*d).serialize(s)
}


//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_go_style_durations() {
        assert_eq!(parse_duration("72h").unwrap(), Duration::from_secs(72 * 3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("3 days").is_err());
    }

    #[test]
    fn format_picks_largest_unit() {
        assert_eq!(format_duration(Duration::from_secs(2160 * 3600)), "2160h");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(61)), "61s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
