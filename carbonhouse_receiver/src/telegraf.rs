//! Telegraf `http` output with `data_format = "json"`.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use carbonhouse_rowbinary::{PointWriter, SendError};
use carbonhouse_tags::escape::{path_escape, query_escape};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

use crate::{
    Base, Result,
    server::{read_body, serve, text_response},
    stat::Stat,
};

#[derive(Debug, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Query part of the stored name. A `name` tag is renamed `_name`.
pub fn encode_tags(tags: &BTreeMap<String, String>) -> String {
    let mut pairs: Vec<(&str, &str)> = tags
        .iter()
        .map(|(k, v)| match k.as_str() {
            "name" => ("_name", v.as_str()),
            k => (k, v.as_str()),
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    for (i, (k, v)) in pairs.into_iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&query_escape(k));
        out.push('=');
        out.push_str(&query_escape(v));
    }
    out
}

fn field_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
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
    let body = match read_body(request.into_body(), base.options.max_message_size).await {
        Ok(body) => body,
        Err(error) => return text_response(error.status(), error.to_string()),
    };
    match process(&base, &body).await {
        Ok(()) => Response::new(Body::empty()),
        Err(error) => {
            debug!(%error, "telegraf write failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}

pub(crate) async fn process(base: &Base, body: &[u8]) -> Result<(), ProcessError> {
    let payload: Payload = serde_json::from_slice(body)?;
    let mut writer = PointWriter::new(&base.sink, CancellationToken::new());
    let written = write_metrics(base, &mut writer, &payload).await;

    base.stats
        .add(Stat::SamplesReceived, u64::from(writer.points_written()));
    base.stats
        .add(Stat::Errors, u64::from(writer.write_errors()));
    written
}

async fn write_metrics(
    base: &Base,
    writer: &mut PointWriter<'_>,
    payload: &Payload,
) -> Result<(), ProcessError> {
    let concat = base.options.concat.as_str();
    let mut name = String::new();

    for metric in &payload.metrics {
        let tags = encode_tags(&metric.tags);
        let timestamp = metric.timestamp as u32;

        for (field, value) in &metric.fields {
            let Some(value) = field_value(value) else {
                continue;
            };
            if value.is_nan() {
                continue;
            }

            name.clear();
            name.push_str(&path_escape(&metric.name));
            if field != "value" {
                name.push_str(concat);
                name.push_str(&path_escape(field));
            }
            name.push('?');
            name.push_str(&tags);

            // one dropped field drops the rest of the metric
            if base.is_drop(name.as_bytes(), writer.now(), timestamp, value) {
                break;
            }
            writer.write_point(name.as_bytes(), value, timestamp).await?;
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

    const PAYLOAD: &str = r#"{
        "metrics": [
            {
                "fields": {"usage_idle": 91.5, "usage_user": 3, "cpu_ok": true, "label": "x"},
                "name": "cpu",
                "tags": {"cpu": "cpu-total", "host": "localhost"},
                "timestamp": 1559465760
            },
            {
                "fields": {"value": 1},
                "name": "name with space",
                "tags": {"name": "n", "tag": "value with space"},
                "timestamp": 1559465761
            }
        ]
    }"#;

    #[test]
    fn tags() {
        let tags: BTreeMap<String, String> = [
            ("name".to_string(), "name with space".to_string()),
            ("tag".to_string(), "value with space".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            encode_tags(&tags),
            "_name=name+with+space&tag=value+with+space"
        );
        assert_eq!(encode_tags(&BTreeMap::new()), "");
    }

    #[tokio::test]
    async fn fields_become_metrics() {
        let (sink, mut rx) = test_util::sink();
        let base = crate::Base::new(Protocol::TelegrafHttpJson, Options::default(), sink);
        process(&base, PAYLOAD.as_bytes()).await.unwrap();

        let points = test_util::drain(&mut rx);
        assert_eq!(
            points
                .iter()
                .map(|p| (p.name.as_str(), p.value, p.timestamp))
                .collect::<Vec<_>>(),
            vec![
                ("cpu.cpu_ok?cpu=cpu-total&host=localhost", 1.0, 1559465760),
                ("cpu.usage_idle?cpu=cpu-total&host=localhost", 91.5, 1559465760),
                ("cpu.usage_user?cpu=cpu-total&host=localhost", 3.0, 1559465760),
                ("name%20with%20space?_name=n&tag=value+with+space", 1.0, 1559465761),
            ]
        );
        assert_eq!(base.stats.get(Stat::SamplesReceived), 4);
    }

    #[tokio::test]
    async fn custom_concat() {
        let (sink, mut rx) = test_util::sink();
        let options = Options {
            concat: "_".to_string(),
            ..Default::default()
        };
        let base = crate::Base::new(Protocol::TelegrafHttpJson, options, sink);
        process(
            &base,
            br#"{"metrics":[{"name":"mem","fields":{"free":1},"tags":{},"timestamp":10}]}"#,
        )
        .await
        .unwrap();
        assert_eq!(test_util::drain(&mut rx)[0].name, "mem_free?");
    }

    #[tokio::test]
    async fn over_http() {
        let (sink, mut rx) = test_util::sink();
        let receiver = Receiver::start(
            Protocol::TelegrafHttpJson,
            "127.0.0.1:0".parse().unwrap(),
            Options::default(),
            sink,
        )
        .await
        .unwrap();
        let url = format!("http://{}/telegraf", receiver.local_addr());
        let client = hyper::Client::new();

        let response = client
            .request(Request::post(&url).body(Body::from(PAYLOAD)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(test_util::collect(&mut rx, 4).await.len(), 4);

        let response = client
            .request(Request::post(&url).body(Body::from("{")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        drop(client);
        receiver.shutdown();
        receiver.join().await;
    }
}
