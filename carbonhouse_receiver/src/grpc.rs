//! Binary RPC receiver, service `carbonpb.Carbon`.
//!
//! Both methods take a [`Message`] and return an empty message. `StoreSync`
//! answers only after every buffer produced from the request has reached the
//! stage file. The service is served over HTTP/2 with gRPC length-prefixed
//! framing; compressed request messages are not supported.

use std::{net::SocketAddr, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use carbonhouse_rowbinary::{ConfirmError, ConfirmGroup, PointWriter, SendError};
use http::{HeaderMap, HeaderValue};
use hyper::{Body, Method, Request, Response, StatusCode};
use prost::Message as _;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use crate::{
    Base, Result,
    server::{read_body, serve},
    stat::Stat,
};

pub const STORE_PATH: &str = "/carbonpb.Carbon/Store";
pub const STORE_SYNC_PATH: &str = "/carbonpb.Carbon/StoreSync";

/// Longest accepted metric name.
pub const MAX_NAME_LEN: usize = 16384;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(message, repeated, tag = "1")]
    pub data: Vec<Metric>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metric {
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
    #[prost(uint32, repeated, tag = "2")]
    pub timestamps: Vec<u32>,
    #[prost(double, repeated, tag = "3")]
    pub values: Vec<f64>,
}

/// gRPC status codes used by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    InvalidArgument = 3,
    Internal = 13,
    Unimplemented = 12,
    Unavailable = 14,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed frame")]
    Framing,

    #[error("compressed messages are not supported")]
    Compressed,

    #[error("invalid message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("{0}")]
    Invalid(&'static str),

    #[error("receiver stopped: {0}")]
    Send(#[from] SendError),

    #[error("write failed: {0}")]
    Confirm(#[from] ConfirmError),
}

impl StoreError {
    pub fn code(&self) -> Code {
        match self {
            Self::Framing | Self::Decode(_) | Self::Invalid(_) => Code::InvalidArgument,
            Self::Compressed => Code::Unimplemented,
            Self::Send(_) => Code::Unavailable,
            Self::Confirm(_) => Code::Internal,
        }
    }
}

/// Unwrap a single length-prefixed message.
pub fn decode_frame(body: &[u8]) -> Result<&[u8], StoreError> {
    let (&compressed, rest) = body.split_first().ok_or(StoreError::Framing)?;
    if compressed != 0 {
        return Err(StoreError::Compressed);
    }
    let len = rest
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or(StoreError::Framing)?;
    rest.get(4..4 + len).ok_or(StoreError::Framing)
}

pub fn encode_frame(message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + message.len());
    out.put_u8(0);
    out.put_u32(message.len() as u32);
    out.put_slice(message);
    out.freeze()
}

/// Reject the whole message if any metric in it is malformed.
pub fn validate(message: &Message) -> Result<usize, StoreError> {
    let mut points = 0;
    for metric in &message.data {
        if metric.name.is_empty() {
            return Err(StoreError::Invalid("name is empty"));
        }
        if metric.name.len() > MAX_NAME_LEN {
            return Err(StoreError::Invalid("name too long"));
        }
        if metric.timestamps.is_empty() {
            return Err(StoreError::Invalid("timestamps is empty"));
        }
        if metric.values.is_empty() {
            return Err(StoreError::Invalid("values is empty"));
        }
        if metric.values.len() != metric.timestamps.len() {
            return Err(StoreError::Invalid("len(values) != len(timestamps)"));
        }
        points += metric.values.len();
    }
    Ok(points)
}

pub(crate) async fn listen(
    base: &Arc<Base>,
    addr: SocketAddr,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<SocketAddr> {
    serve(base, addr, true, shutdown, tasks, handle).await
}

async fn handle(base: Arc<Base>, request: Request<Body>) -> Response<Body> {
    let sync = match (request.method(), request.uri().path()) {
        (&Method::POST, STORE_PATH) => false,
        (&Method::POST, STORE_SYNC_PATH) => true,
        _ => return status_response(Code::Unimplemented, "unknown method"),
    };
    let body = match read_body(request.into_body(), base.options.max_message_size).await {
        Ok(body) => body,
        Err(error) => return status_response(Code::InvalidArgument, &error.to_string()),
    };

    match store_frame(&base, &body, sync).await {
        Ok(()) => ok_response(),
        Err(error) => {
            base.stats.incr(Stat::Errors);
            debug!(%error, sync, "store failed");
            status_response(error.code(), &error.to_string())
        }
    }
}

async fn store_frame(base: &Base, body: &[u8], sync: bool) -> Result<(), StoreError> {
    let message = Message::decode(decode_frame(body)?)?;
    store(base, &message, sync).await
}

/// Write every point of `message`, waiting for the stage file when `sync`.
pub(crate) async fn store(base: &Base, message: &Message, sync: bool) -> Result<(), StoreError> {
    validate(message)?;

    let group = sync.then(ConfirmGroup::new);
    let mut writer = PointWriter::new(&base.sink, CancellationToken::new());
    if let Some(group) = &group {
        writer = writer.with_confirm(group);
    }
    for metric in &message.data {
        for (&timestamp, &value) in metric.timestamps.iter().zip(&metric.values) {
            writer.write_point(&metric.name, value, timestamp).await?;
        }
    }
    writer.flush().await?;
    base.stats
        .add(Stat::MetricsReceived, u64::from(writer.points_written()));
    base.stats
        .add(Stat::Errors, u64::from(writer.write_errors()));
    drop(writer);

    if let Some(group) = group {
        group.wait().await?;
    }
    Ok(())
}

fn grpc_headers(headers: &mut HeaderMap, code: Code, message: Option<&str>) {
    headers.insert("grpc-status", HeaderValue::from(code as u16));
    if let Some(message) = message.and_then(|m| HeaderValue::from_str(m).ok()) {
        headers.insert("grpc-message", message);
    }
}

/// Trailers-only response carrying an error status.
fn status_response(code: Code, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    grpc_headers(response.headers_mut(), code, Some(message));
    response
}

/// An empty message followed by an OK status in the trailers.
fn ok_response() -> Response<Body> {
    let (mut tx, body) = Body::channel();
    tokio::spawn(async move {
        if tx.send_data(encode_frame(&[])).await.is_ok() {
            let mut trailers = HeaderMap::new();
            grpc_headers(&mut trailers, Code::Ok, None);
            let _ = tx.send_trailers(trailers).await;
        }
    });

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
}
