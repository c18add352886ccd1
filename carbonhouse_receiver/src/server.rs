//! Plumbing shared by the HTTP based receivers.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use hyper::{
    Body, Request, Response, StatusCode,
    body::HttpBody,
    server::conn::{AddrIncoming, AddrStream},
    service::{make_service_fn, service_fn},
};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::error;

use crate::{Base, Error, Result};

#[derive(Debug, thiserror::Error)]
pub(crate) enum BodyError {
    #[error("client hangup: {0}")]
    ClientHangup(#[from] hyper::Error),

    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
}

impl BodyError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::ClientHangup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Collect a request body, refusing anything over `limit` bytes.
pub(crate) async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut out = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge(limit));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

pub(crate) fn text_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut text = text.into();
    text.push('\n');
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

/// Bind `addr` and serve `handler` on it until `shutdown` fires.
pub(crate) async fn serve<F, Fut>(
    base: &Arc<Base>,
    addr: SocketAddr,
    http2_only: bool,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
    handler: F,
) -> Result<SocketAddr>
where
    F: Fn(Arc<Base>, Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    let protocol = base.protocol;
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        protocol,
        addr,
        source,
    })?;
    let incoming = AddrIncoming::from_listener(listener)
        .map_err(|source| Error::Serve { protocol, source })?;
    let local_addr = incoming.local_addr();

    let base = Arc::clone(base);
    let server = hyper::Server::builder(incoming)
        .http2_only(http2_only)
        .serve(make_service_fn(move |_conn: &AddrStream| {
            let base = Arc::clone(&base);
            let handler = handler.clone();
            let service = service_fn(move |request: Request<Body>| {
                let response = handler(Arc::clone(&base), request);
                async move { Ok::<_, Infallible>(response.await) }
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tasks.spawn(async move {
        if let Err(error) = server.await {
            error!(%protocol, %error, "server failed");
        }
    });
    Ok(local_addr)
}
