//! Serde adapters for human-readable durations and byte sizes in config.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

use crate::utils::human_format;

/// `Duration` as `"30s"`, `"5m"`, `"1h30m"` or bare seconds.
pub mod duration {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&human_format::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("seconds or a human duration such as '30s', '5m', '1h30m'")
            }

            fn visit_u64<E: de::Error>(self, seconds: u64) -> Result<Self::Value, E> {
                Ok(Duration::from_secs(seconds))
            }

            fn visit_i64<E: de::Error>(self, seconds: i64) -> Result<Self::Value, E> {
                u64::try_from(seconds)
                    .map(Duration::from_secs)
                    .map_err(|_| de::Error::custom("duration cannot be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                human_format::parse_duration(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Byte sizes as `"64KB"`, `"100MB"` or bare bytes.
pub mod byte_size {
    use super::*;

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&human_format::format_bytes(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = u64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("bytes or a size such as '64KB', '100MB'")
            }

            fn visit_u64<E: de::Error>(self, bytes: u64) -> Result<Self::Value, E> {
                Ok(bytes)
            }

            fn visit_i64<E: de::Error>(self, bytes: i64) -> Result<Self::Value, E> {
                u64::try_from(bytes).map_err(|_| de::Error::custom("size cannot be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                human_format::parse_bytes(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(with = "super::duration")]
        wait: Duration,
        #[serde(with = "super::byte_size")]
        limit: u64,
    }

    #[test]
    fn deserializes_human_forms() {
        let sample: Sample = toml::from_str("wait = \"1h30m\"\nlimit = \"64KB\"").unwrap();
        assert_eq!(sample.wait, Duration::from_secs(5400));
        assert_eq!(sample.limit, 64 * 1024);
    }

    #[test]
    fn deserializes_bare_numbers() {
        let sample: Sample = toml::from_str("wait = 90\nlimit = 4096").unwrap();
        assert_eq!(sample.wait, Duration::from_secs(90));
        assert_eq!(sample.limit, 4096);
    }
}
