//! Per-table upload settings, read from the `[upload.<name>]` sections of
//! the config file.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, tls::Tls};

/// Day used for tree rows when no `date` is configured (1970-02-12).
pub const DEFAULT_TREE_DATE: u16 = 42;

/// Table shape an uploader produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    #[default]
    Points,
    PointsReverse,
    Series,
    SeriesReverse,
    #[serde(alias = "tree")]
    Index,
    Tagged,
}

impl Kind {
    /// Kinds that skip keys already uploaded by an earlier file.
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            Self::Series | Self::SeriesReverse | Self::Index | Self::Tagged
        )
    }

    pub(crate) fn columns(self) -> &'static str {
        match self {
            Self::Points | Self::PointsReverse => "(Path, Value, Time, Date, Timestamp)",
            Self::Series | Self::SeriesReverse | Self::Index => "(Date, Level, Path, Version)",
            Self::Tagged => "(Date, Tag1, Path, Tags, Version)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// How names are turned into dedup cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum KeyHash {
    /// The name itself.
    #[default]
    #[serde(rename = "")]
    None,
    /// CityHash v1.0.2 of the name cut to 64 bits, for trees too large to
    /// keep verbatim.
    #[serde(rename = "city64")]
    City64,
    /// Hex xxHash64 of the name.
    #[serde(rename = "xxh64")]
    Xxh64,
}

impl KeyHash {
    /// `"<days>:<hashed name>"`.
    pub fn key(self, days: u16, name: &[u8]) -> String {
        match self {
            Self::None => format!("{days}:{}", String::from_utf8_lossy(name)),
            Self::City64 => format!(
                "{days}:{:016x}",
                cityhash_rs::cityhash_102_128(name) as u64
            ),
            Self::Xxh64 => format!(
                "{days}:{:016x}",
                twox_hash::XxHash64::oneshot(0, name)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "type")]
    pub kind: Kind,
    /// Destination table; empty means the section name.
    pub table: String,
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub threads: usize,
    /// Lifetime of dedup cache entries; zero keeps them forever.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// `YYYY-MM-DD` day for tree rows of the index kind.
    pub date: String,
    /// Points kinds: store zero in the `Timestamp` column.
    pub zero_timestamp: bool,
    /// Points kinds: untagged names matching any of these are not uploaded.
    pub ignored_patterns: Vec<String>,
    pub compression: Compression,
    /// Tagged kind: only the `__name__` row is uploaded for these names;
    /// `*` matches every name.
    pub ignored_tagged_metrics: Vec<String>,
    pub hash: KeyHash,
    pub disable_daily_index: bool,
    /// Client certificate settings for `https` urls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: Kind::Points,
            table: String::new(),
            url: "http://localhost:8123/".to_string(),
            timeout: Duration::from_secs(60),
            threads: 1,
            cache_ttl: Duration::from_secs(12 * 3600),
            date: String::new(),
            zero_timestamp: false,
            ignored_patterns: vec![],
            compression: Compression::None,
            ignored_tagged_metrics: vec![],
            hash: KeyHash::None,
            disable_daily_index: false,
            tls: None,
        }
    }
}

impl Config {
    /// Check everything serde cannot.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url).map_err(|source| Error::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;
        self.tree_date()?;
        if self.threads == 0 {
            return Err(Error::NoThreads);
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    pub fn tree_date(&self) -> Result<u16> {
        if self.date.is_empty() {
            return Ok(DEFAULT_TREE_DATE);
        }
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").map_err(|source| {
            Error::InvalidDate {
                date: self.date.clone(),
                source,
            }
        })?;
        let days = date.signed_duration_since(NaiveDate::default()).num_days();
        u16::try_from(days).map_err(|_| Error::DateOutOfRange {
            date: self.date.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str(r#"type = "tree""#).unwrap();
        assert_eq!(config.kind, Kind::Index);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.cache_ttl, Duration::from_secs(43200));
        assert_eq!(config.threads, 1);
        assert_eq!(config.tree_date().unwrap(), DEFAULT_TREE_DATE);
        config.validate().unwrap();
    }

    #[test]
    fn full() {
        let config: Config = toml::from_str(
            r#"
            type = "points-reverse"
            table = "graphite_reverse"
            url = "http://clickhouse:8123/?user=carbon"
            timeout = "30s"
            threads = 4
            cache-ttl = "1h"
            date = "2016-11-01"
            zero-timestamp = true
            ignored-patterns = ["a.b.*.d"]
            compression = "gzip"
            hash = "xxh64"

            [tls]
            ca-cert = ["/etc/ssl/clickhouse-ca.pem"]
            min-version = "TLS12"

            [[tls.certificates]]
            key = "/etc/ssl/carbon.key"
            cert = "/etc/ssl/carbon.pem"
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, Kind::PointsReverse);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.hash, KeyHash::Xxh64);
        assert_eq!(config.tree_date().unwrap(), 17106);
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.certificates.len(), 1);
        assert_eq!(tls.certificates[0].cert, std::path::PathBuf::from("/etc/ssl/carbon.pem"));
        assert_eq!(tls.min_version, "TLS12");
        assert!(!tls.insecure_skip_verify);
        config.validate().unwrap();
    }

    #[test]
    fn invalid() {
        assert!(toml::from_str::<Config>(r#"type = "graphite""#).is_err());
        assert!(toml::from_str::<Config>(r#"hash = "city128""#).is_err());

        let config = Config {
            date: "01.11.2016".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidDate { .. })));

        let config = Config {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidUrl { .. })));
    }

    #[test]
    fn keys() {
        assert_eq!(KeyHash::None.key(18049, b"a.b.c"), "18049:a.b.c");
        for hash in [KeyHash::City64, KeyHash::Xxh64] {
            let hashed = hash.key(18049, b"a.b.c");
            assert!(hashed.starts_with("18049:"), "{hashed}");
            assert_eq!(hashed.len(), "18049:".len() + 16);
            assert_eq!(hashed, hash.key(18049, b"a.b.c"));
            assert_ne!(hashed, hash.key(18049, b"a.b.d"));
            assert_ne!(hashed, hash.key(18050, b"a.b.c"));
        }
        assert_ne!(
            KeyHash::City64.key(18049, b"a.b.c"),
            KeyHash::Xxh64.key(18049, b"a.b.c")
        );
    }

    #[test]
    fn city64_option() {
        let config: Config = toml::from_str(
            r#"
            type = "tagged"
            hash = "city64"
            "#,
        )
        .unwrap();
        assert_eq!(config.hash, KeyHash::City64);
        assert_eq!(
            KeyHash::City64.key(0, b""),
            format!("0:{:016x}", cityhash_rs::cityhash_102_128(b"") as u64)
        );
    }
}
