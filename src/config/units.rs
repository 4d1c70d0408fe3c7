//! Human-friendly durations and byte sizes for the config file.
//!
//! Durations accept `500ms`, `30s`, `5m`, `1h`, `2d` or a bare number of
//! seconds. Byte sizes accept `64k`, `512m`, `1g` (binary multiples) or a bare
//! number of bytes.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::{Result, SandboxError};

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if let Some(ms) = s.strip_suffix("ms") {
        let num: u64 = ms
            .trim()
            .parse()
            .map_err(|_| SandboxError::Config(format!("Invalid duration: {}", s)))?;
        return Ok(Duration::from_millis(num));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('s') {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600u64)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86400u64)
    } else {
        // Assume seconds if no suffix
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("Invalid duration: {}", s)))?;

    num.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| SandboxError::Config(format!("Duration overflows: {}", s)))
}

pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else {
        format!("{}s", d.as_secs())
    }
}

pub fn parse_byte_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('k') {
        (n, 1u64 << 10)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1u64 << 20)
    } else if let Some(n) = s.strip_suffix('g') {
        (n, 1u64 << 30)
    } else {
        (s, 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("Invalid byte size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SandboxError::Config(format!("Byte size overflows: {}", s)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

/// Serde adapter for `Duration` fields.
pub mod duration {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(secs) => Ok(Duration::from_secs(secs)),
            NumberOrString::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Serde adapter for byte-size fields.
pub mod byte_size {
    use super::*;

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(*v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(matches!(
            parse_duration("999999999999999999d"),
            Err(SandboxError::Config(_))
        ));
        assert!(parse_duration("99999999999999999999s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_byte_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("64mb").unwrap(), 64 << 20);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert!(parse_byte_size("lots").is_err());
    }
}
