//! Health and introspection endpoints.
//!
//! * `GET /health`
//! * `GET /debug/receive/<protocol>/dropped/`: recently dropped samples
//! * `GET /debug/upload/<name>/cache-size`: entries in a dedup cache

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use carbonhouse_receiver::Receiver;
use carbonhouse_uploader::Uploader;
use hyper::{
    Body, Method, Request, Response, StatusCode,
    server::conn::AddrIncoming,
    service::{make_service_fn, service_fn},
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind debug listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start debug server: {0}")]
    Serve(#[from] hyper::Error),
}

/// What the endpoints can look into.
#[derive(Debug, Default)]
pub struct DebugState {
    pub receivers: Vec<Arc<Receiver>>,
    pub uploaders: Vec<Arc<Uploader>>,
}

impl DebugState {
    fn route(&self, request: &Request<Body>) -> Response<Body> {
        if request.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let path = request.uri().path();
        if path == "/health" {
            return text(StatusCode::OK, "OK");
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["debug", "receive", protocol, "dropped"] => {
                match self.receivers.iter().find(|r| r.protocol().name() == *protocol) {
                    Some(receiver) => {
                        let mut body = receiver.dropped().join("\n");
                        if !body.is_empty() {
                            body.push('\n');
                        }
                        Response::new(Body::from(body))
                    }
                    None => text(StatusCode::NOT_FOUND, "receiver not found"),
                }
            }
            ["debug", "upload", name, "cache-size"] => {
                match self.uploaders.iter().find(|u| u.name() == *name) {
                    Some(uploader) => match uploader.cache_size() {
                        Some(size) => text(StatusCode::OK, size.to_string()),
                        None => text(StatusCode::NOT_FOUND, "uploader has no cache"),
                    },
                    None => text(StatusCode::NOT_FOUND, "uploader not found"),
                }
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn text(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut text = text.into();
    text.push('\n');
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

/// Bind `addr` and serve until `shutdown` fires. Returns the bound address
/// and the server future.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<DebugState>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })?;
    let incoming = AddrIncoming::from_listener(listener)?;
    let local_addr = incoming.local_addr();

    let server = hyper::Server::builder(incoming)
        .serve(make_service_fn(move |_conn| {
            let state = Arc::clone(&state);
            let service = service_fn(move |request: Request<Body>| {
                let response = state.route(&request);
                async move { Ok::<_, Infallible>(response) }
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled_owned());

    info!(%local_addr, "debug server started");
    Ok((local_addr, async move {
        if let Err(error) = server.await {
            error!(%error, "debug server failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use carbonhouse_receiver::{Options, Protocol};
    use carbonhouse_rowbinary::WriteSink;
    use hyper::body::to_bytes;
    use std::time::Duration;
    use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc};

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let uri = format!("http://{addr}{path}");
        let response = hyper::Client::new().get(uri.parse().unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn endpoints() {
        let (tx, _rx) = mpsc::channel(4);
        let sink = WriteSink::new(tx, CancellationToken::new());
        let options = Options {
            drop_future: Duration::from_secs(60),
            parse_threads: 1,
            ..Default::default()
        };
        let receiver = Receiver::start(
            Protocol::Tcp,
            "127.0.0.1:0".parse().unwrap(),
            options,
            sink,
        )
        .await
        .unwrap();
        let receiver = Arc::new(receiver);

        let dir = tempfile::tempdir().unwrap();
        let in_progress: carbonhouse_uploader::InProgress = Arc::new(|_: &str| false);
        let tree = Uploader::new(
            "graphite_tree",
            dir.path(),
            carbonhouse_uploader::Config {
                kind: carbonhouse_uploader::Kind::Index,
                ..Default::default()
            },
            Arc::clone(&in_progress),
        )
        .unwrap();
        let points = Uploader::new(
            "graphite",
            dir.path(),
            carbonhouse_uploader::Config::default(),
            in_progress,
        )
        .unwrap();

        let state = Arc::new(DebugState {
            receivers: vec![Arc::clone(&receiver)],
            uploaders: vec![tree, points],
        });
        let shutdown = CancellationToken::new();
        let (addr, server) = serve("127.0.0.1:0".parse().unwrap(), state, shutdown.clone())
            .await
            .unwrap();
        let server = tokio::spawn(server);

        assert_eq!(get(addr, "/health").await, (StatusCode::OK, "OK\n".to_string()));
        assert_eq!(
            get(addr, "/debug/upload/graphite_tree/cache-size").await,
            (StatusCode::OK, "0\n".to_string())
        );
        assert_eq!(
            get(addr, "/debug/upload/graphite/cache-size").await.0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(get(addr, "/nope").await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            get(addr, "/debug/receive/tcp/dropped/").await,
            (StatusCode::OK, String::new())
        );

        // a sample far in the future lands in the dropped list
        let mut conn = TcpStream::connect(receiver.local_addr()).await.unwrap();
        conn.write_all(b"too.late 1 4000000000\n").await.unwrap();
        drop(conn);
        let mut dropped = String::new();
        for _ in 0..100 {
            dropped = get(addr, "/debug/receive/tcp/dropped/").await.1;
            if !dropped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dropped.contains("name:too.late"), "{dropped}");
        assert!(dropped.contains("timestamp:4000000000"), "{dropped}");

        shutdown.cancel();
        server.await.unwrap();
        receiver.shutdown();
        receiver.join().await;
    }
}
