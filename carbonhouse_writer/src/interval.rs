//! Chunk interval that grows with the upload backlog.
//!
//! Written as `"<unhandled files>:<interval>,..."`, e.g. `"5:10s,20:60s"`:
//! once at least 5 stage files wait for upload chunks are rotated every
//! 10 seconds, from 20 files on every minute. Below the lowest threshold, or
//! when empty, the configured `chunk-interval` applies.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoInterval {
    /// Sorted by threshold.
    steps: Vec<(u64, Duration)>,
}

impl AutoInterval {
    /// Interval for a backlog of `unhandled` files.
    pub fn interval(&self, unhandled: u64, default: Duration) -> Duration {
        self.steps
            .iter()
            .take_while(|(threshold, _)| unhandled >= *threshold)
            .last()
            .map_or(default, |(_, interval)| *interval)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromStr for AutoInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut steps = vec![];
        for step in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (threshold, interval) = step
                .split_once(':')
                .ok_or_else(|| format!("{step:?} is not <unhandled>:<interval>"))?;
            let threshold: u64 = threshold
                .trim()
                .parse()
                .map_err(|e| format!("threshold {threshold:?}: {e}"))?;
            let interval = humantime::parse_duration(interval.trim())
                .map_err(|e| format!("interval {interval:?}: {e}"))?;
            if interval.is_zero() {
                return Err(format!("interval of {step:?} is zero"));
            }
            if steps.iter().any(|(t, _)| *t == threshold) {
                return Err(format!("threshold {threshold} is repeated"));
            }
            steps.push((threshold, interval));
        }
        steps.sort_unstable_by_key(|(threshold, _)| *threshold);
        Ok(Self { steps })
    }
}

impl fmt::Display for AutoInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (threshold, interval)) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{threshold}:{}", humantime::format_duration(*interval))?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for AutoInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for AutoInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEFAULT: Duration = Duration::from_secs(1);

    #[test]
    fn picks_the_highest_reached_threshold() {
        let auto: AutoInterval = "20:60s, 5:10s".parse().unwrap();
        assert_eq!(auto.interval(0, DEFAULT), DEFAULT);
        assert_eq!(auto.interval(4, DEFAULT), DEFAULT);
        assert_eq!(auto.interval(5, DEFAULT), Duration::from_secs(10));
        assert_eq!(auto.interval(19, DEFAULT), Duration::from_secs(10));
        assert_eq!(auto.interval(20, DEFAULT), Duration::from_secs(60));
        assert_eq!(auto.interval(1000, DEFAULT), Duration::from_secs(60));
        assert_eq!(auto.to_string(), "5:10s,20:1m");
        assert_eq!(auto.to_string().parse::<AutoInterval>().unwrap(), auto);
    }

    #[test]
    fn empty_means_the_default() {
        let auto: AutoInterval = "".parse().unwrap();
        assert!(auto.is_empty());
        assert_eq!(auto.interval(100, DEFAULT), DEFAULT);
        assert_eq!(auto.to_string(), "");
    }

    #[test]
    fn invalid() {
        for text in ["5", "x:10s", "5:ten", "5:0s", "5:1s,5:2s"] {
            assert!(text.parse::<AutoInterval>().is_err(), "{text}");
        }
    }
}
