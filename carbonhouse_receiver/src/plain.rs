//! Graphite plain-text protocol: `name value timestamp\n`.

use std::{borrow::Cow, sync::Arc};

use bytes::Bytes;
use carbonhouse_rowbinary::PointWriter;
use carbonhouse_tags::{TagRules, graphite};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Base, stat::Stat};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("bad message: {0:?}")]
    BadMessage(String),

    #[error(transparent)]
    Tags(#[from] carbonhouse_tags::Error),
}

/// Complete lines cut from a connection or datagram, stamped with the time
/// they were read.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    pub time: u32,
}

/// Collapse runs of dots: `a..b` is `a.b`.
pub fn remove_double_dot(name: &str) -> Cow<'_, str> {
    if !name.contains("..") {
        return Cow::Borrowed(name);
    }
    let mut out = String::with_capacity(name.len());
    let mut prev_dot = false;
    for c in name.chars() {
        if c == '.' && prev_dot {
            continue;
        }
        prev_dot = c == '.';
        out.push(c);
    }
    Cow::Owned(out)
}

/// Parse one line, trailing `\n` or `\r\n` included.
///
/// A timestamp of `-1` means `now`; fractional timestamps are truncated.
pub fn parse_line<'a>(
    rules: &TagRules,
    line: &'a [u8],
    now: u32,
) -> Result<(Cow<'a, str>, f64, u32), ParseError> {
    let bad = || ParseError::BadMessage(String::from_utf8_lossy(line).into_owned());

    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);

    let i1 = match trimmed.iter().position(|&b| b == b' ') {
        Some(i) if i >= 1 => i,
        _ => return Err(bad()),
    };
    let rest = &trimmed[i1 + 1..];
    let i2 = match rest.iter().position(|&b| b == b' ') {
        Some(i) if i >= 1 => i,
        _ => return Err(bad()),
    };

    let value = std::str::from_utf8(&rest[..i2])
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| !v.is_nan())
        .ok_or_else(bad)?;

    let ts = &rest[i2 + 1..];
    let timestamp = if ts == b"-1" {
        now
    } else {
        let ts = std::str::from_utf8(ts)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| !v.is_nan())
            .ok_or_else(bad)?;
        ts as u32
    };

    let name = std::str::from_utf8(&trimmed[..i1]).map_err(|_| bad())?;
    let name = match remove_double_dot(name) {
        Cow::Borrowed(name) => graphite(rules, name)?,
        Cow::Owned(name) => Cow::Owned(graphite(rules, &name)?.into_owned()),
    };
    Ok((name, value, timestamp))
}

/// Parse every line of `chunk` and send the result to the writer.
pub(crate) async fn parse_chunk(base: &Base, chunk: &Chunk) {
    // lines already read are written even while the receiver stops
    let mut writer = PointWriter::with_now(&base.sink, CancellationToken::new(), chunk.time);
    let mut errors = 0u64;
    let mut data = &chunk.data[..];

    while !data.is_empty() {
        let Some(end) = data.iter().position(|&b| b == b'\n') else {
            errors += 1;
            debug!(protocol = %base.protocol, line = %String::from_utf8_lossy(data), "unfinished line");
            break;
        };
        if end == 0 {
            data = &data[1..];
            continue;
        }
        let line = &data[..=end];
        data = &data[end + 1..];

        let (name, value, timestamp) = match parse_line(&base.options.tags, line, chunk.time) {
            Ok(parsed) => parsed,
            Err(error) => {
                errors += 1;
                debug!(protocol = %base.protocol, %error, "parse failed");
                continue;
            }
        };
        if base.is_drop(name.as_bytes(), chunk.time, timestamp, value) {
            continue;
        }
        if let Err(error) = writer.write_point(name.as_bytes(), value, timestamp).await {
            warn!(protocol = %base.protocol, %error, "points lost");
            break;
        }
    }
    if let Err(error) = writer.flush().await {
        warn!(protocol = %base.protocol, %error, "points lost");
    }

    base.stats
        .add(Stat::MetricsReceived, u64::from(writer.points_written()));
    base.stats
        .add(Stat::Errors, errors + u64::from(writer.write_errors()));
}

/// Parse worker: runs until every sender of `rx` is gone.
pub(crate) async fn parser(base: Arc<Base>, rx: Arc<Mutex<mpsc::Receiver<Chunk>>>) {
    loop {
        let chunk = { rx.lock().await.recv().await };
        match chunk {
            Some(chunk) => parse_chunk(&base, &chunk).await,
            None => return,
        }
    }
}
