//! Graphite pickle protocol.
//!
//! A connection carries frames of a 4-byte big-endian length followed by a
//! pickled list of `(name, (timestamp, value), ...)` series.

use std::{net::SocketAddr, sync::Arc};

use carbonhouse_rowbinary::PointWriter;
use carbonhouse_tags::{TagRules, graphite};
use serde_pickle::{DeOptions, Value};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{Base, Error, Result, stat::Stat};

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 67_108_864;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("can't unpickle message: {0}")]
    Unpickle(#[from] serde_pickle::Error),

    #[error("unexpected structure: {0}")]
    Structure(&'static str),
}

/// One decoded point, name already canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub name: String,
    pub value: f64,
    pub timestamp: u32,
}

fn items(value: &Value) -> Option<&[Value]> {
    match value {
        Value::List(items) | Value::Tuple(items) => Some(items),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::I64(v) => Some(*v as f64),
        Value::F64(v) => Some(*v),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<u32> {
    match value {
        Value::I64(v) => u32::try_from(*v).ok(),
        Value::F64(v) if *v >= 0.0 && *v <= f64::from(u32::MAX) => Some(*v as u32),
        _ => None,
    }
}

fn series_name(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Bytes(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

/// Decode a frame.
///
/// Decoding stops at the first malformed series; points decoded before it
/// are returned together with the error. Names that fail canonicalization
/// are counted in the returned error count and skipped.
pub fn decode(rules: &TagRules, data: &[u8]) -> (Vec<Point>, u64, Option<DecodeError>) {
    let mut points = vec![];
    let mut name_errors = 0;

    let value = match serde_pickle::value_from_slice(data, DeOptions::new()) {
        Ok(value) => value,
        Err(error) => return (points, name_errors, Some(error.into())),
    };
    let Some(series) = items(&value) else {
        return (points, name_errors, Some(DecodeError::Structure("not a list")));
    };

    for entry in series {
        let Some(entry) = items(entry).filter(|e| e.len() >= 2) else {
            return (points, name_errors, Some(DecodeError::Structure("bad series")));
        };
        let Some(raw_name) = series_name(&entry[0]) else {
            return (points, name_errors, Some(DecodeError::Structure("bad name")));
        };
        let name = match graphite(rules, raw_name) {
            Ok(name) => name.into_owned(),
            Err(error) => {
                debug!(%error, "invalid name");
                name_errors += 1;
                continue;
            }
        };

        for point in &entry[1..] {
            let parsed = items(point)
                .filter(|p| p.len() == 2)
                .and_then(|p| Some((timestamp(&p[0])?, number(&p[1])?)));
            let Some((timestamp, value)) = parsed else {
                return (points, name_errors, Some(DecodeError::Structure("bad point")));
            };
            points.push(Point {
                name: name.clone(),
                value,
                timestamp,
            });
        }
    }
    (points, name_errors, None)
}

pub(crate) async fn listen(
    base: &Arc<Base>,
    addr: SocketAddr,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        protocol: base.protocol,
        addr,
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| Error::Bind {
        protocol: base.protocol,
        addr,
        source,
    })?;

    let base = Arc::clone(base);
    let shutdown = shutdown.clone();
    let conn_tasks = tasks.clone();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        conn_tasks.spawn(handle_connection(
                            Arc::clone(&base),
                            stream,
                            peer,
                            shutdown.clone(),
                        ));
                    }
                    Err(error) => warn!(%error, "failed to accept connection"),
                },
            }
        }
    });
    Ok(local_addr)
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    };
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad message size {len}"),
        ));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

async fn handle_connection(
    base: Arc<Base>,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let _active = base.stats.active_guard();
    let read_timeout = base.options.read_timeout;

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = tokio::time::timeout(read_timeout, read_frame(&mut stream)) => read,
        };
        let data = match read {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => return,
            Ok(Err(error)) => {
                base.stats.incr(Stat::Errors);
                warn!(%peer, %error, "can't read message");
                return;
            }
            Err(_) => {
                base.stats.incr(Stat::Errors);
                warn!(%peer, timeout = ?read_timeout, "read timed out");
                return;
            }
        };
        base.stats.incr(Stat::MessagesReceived);
        store_frame(&base, &data).await;
    }
}

pub(crate) async fn store_frame(base: &Base, data: &[u8]) {
    let (points, mut errors, error) = decode(&base.options.tags, data);
    if let Some(error) = error {
        errors += 1;
        debug!(protocol = %base.protocol, %error, "malformed frame");
    }

    let mut writer = PointWriter::new(&base.sink, CancellationToken::new());
    for point in &points {
        if base.is_drop(point.name.as_bytes(), writer.now(), point.timestamp, point.value) {
            continue;
        }
        if let Err(error) = writer
            .write_point(point.name.as_bytes(), point.value, point.timestamp)
            .await
        {
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
