//! Prometheus remote-write over HTTP.
//!
//! The body is a snappy block-compressed `WriteRequest`. Every label set is
//! turned into one canonical tagged name; samples are stored with the
//! timestamp truncated to seconds.

use std::{net::SocketAddr, sync::Arc};

use carbonhouse_rowbinary::{PointWriter, SendError};
use hyper::{Body, Method, Request, Response, StatusCode};
use prost::Message;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use crate::{
    Base, Result,
    server::{read_body, serve, text_response},
    stat::Stat,
};

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid write request: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Send(#[from] SendError),
}

pub(crate) async fn listen(
    base: &Arc<Base>,
    addr: SocketAddr,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<SocketAddr> {
    serve(base, addr, false, shutdown, tasks, handle).await
}

async fn handle(base: Arc<Base>, request: Request<Body>) -> Response<Body> {
    if request.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "use POST");
    }
    let compressed = match read_body(request.into_body(), base.options.max_message_size).await {
        Ok(body) => body,
        Err(error) => return text_response(error.status(), error.to_string()),
    };
    let body = match snap::raw::Decoder::new().decompress_vec(&compressed) {
        Ok(body) => body,
        Err(error) => return text_response(StatusCode::BAD_REQUEST, error.to_string()),
    };
    match process(&base, &body).await {
        Ok(()) => Response::new(Body::empty()),
        Err(error) => {
            debug!(%error, "remote write failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}

/// Decode and store one uncompressed `WriteRequest`.
pub(crate) async fn process(base: &Base, body: &[u8]) -> Result<(), ProcessError> {
    let request = WriteRequest::decode(body)?;
    let mut writer = PointWriter::new(&base.sink, CancellationToken::new());
    let written = write_series(base, &mut writer, &request).await;

    base.stats
        .add(Stat::SamplesReceived, u64::from(writer.points_written()));
    base.stats
        .add(Stat::Errors, u64::from(writer.write_errors()));
    written
}

async fn write_series(
    base: &Base,
    writer: &mut PointWriter<'_>,
    request: &WriteRequest,
) -> Result<(), ProcessError> {
    for series in &request.timeseries {
        let name = carbonhouse_tags::prometheus(
            series
                .labels
                .iter()
                .map(|l| (l.name.as_str(), l.value.as_str())),
        );
        for sample in &series.samples {
            if sample.value.is_nan() {
                continue;
            }
            let timestamp = (sample.timestamp / 1000) as u32;
            if base.is_drop(name.as_bytes(), writer.now(), timestamp, sample.value) {
                continue;
            }
            writer
                .write_point(name.as_bytes(), sample.value, timestamp)
                .await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Options, Protocol, Receiver, test_util};
    use pretty_assertions::assert_eq;

    fn label(name: &str, value: &str) -> Label {
        Label {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![
                TimeSeries {
                    labels: vec![
                        label("instance", "localhost:9090"),
                        label("__name__", "up"),
                        label("job", "prometheus"),
                    ],
                    samples: vec![
                        Sample {
                            value: 1.0,
                            timestamp: 1559465760123,
                        },
                        Sample {
                            value: f64::NAN,
                            timestamp: 1559465761000,
                        },
                    ],
                },
                TimeSeries {
                    labels: vec![label("__name__", "go_goroutines")],
                    samples: vec![Sample {
                        value: 42.0,
                        timestamp: 1559465762999,
                    }],
                },
            ],
        }
    }

    #[tokio::test]
    async fn decode_and_store() {
        let (sink, mut rx) = test_util::sink();
        let base = crate::Base::new(Protocol::Prometheus, Options::default(), sink);
        process(&base, &request().encode_to_vec()).await.unwrap();

        let points = test_util::drain(&mut rx);
        assert_eq!(
            points
                .iter()
                .map(|p| (p.name.as_str(), p.value, p.timestamp))
                .collect::<Vec<_>>(),
            vec![
                ("up?instance=localhost%3A9090&job=prometheus", 1.0, 1559465760),
                ("go_goroutines?", 42.0, 1559465762),
            ]
        );
        assert_eq!(base.stats.get(Stat::SamplesReceived), 2);
    }

    #[tokio::test]
    async fn garbage_is_an_error() {
        let (sink, _rx) = test_util::sink();
        let base = crate::Base::new(Protocol::Prometheus, Options::default(), sink);
        assert!(matches!(
            process(&base, b"\xff\xff\xff").await,
            Err(ProcessError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn over_http() {
        let (sink, mut rx) = test_util::sink();
        let receiver = Receiver::start(
            Protocol::Prometheus,
            "127.0.0.1:0".parse().unwrap(),
            Options::default(),
            sink,
        )
        .await
        .unwrap();
        let url = format!("http://{}/api/v1/write", receiver.local_addr());
        let client = hyper::Client::new();

        let body = snap::raw::Encoder::new()
            .compress_vec(&request().encode_to_vec())
            .unwrap();
        let response = client
            .request(Request::post(&url).body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(test_util::collect(&mut rx, 2).await.len(), 2);

        let response = client
            .request(Request::post(&url).body(Body::from("not snappy")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        drop(client);
        receiver.shutdown();
        receiver.join().await;
    }
}
