//! Streaming `INSERT INTO <table> FORMAT RowBinary` requests.

use std::{
    io::{self, Write},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use flate2::write::GzEncoder;
use reqwest::{StatusCode, header::CONTENT_ENCODING};
use tokio::sync::mpsc;
use url::Url;

use crate::{Error, Result, config::Compression, tls::Tls};

/// Body bytes handed to the HTTP client at a time.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Chunks queued between the file transform and the request.
const BODY_QUEUE: usize = 4;

/// Part of an error response kept in the error.
pub(crate) const ERROR_BODY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct Client {
    http: reqwest::Client,
    url: Url,
    compression: Compression,
}

impl Client {
    pub(crate) fn new(
        url: &str,
        timeout: Duration,
        compression: Compression,
        tls: Option<&Tls>,
    ) -> Result<Self> {
        let url = Url::parse(url).map_err(|source| Error::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(tls) = tls {
            builder = tls.configure(builder)?;
        }
        let http = builder.build().map_err(Error::Client)?;
        Ok(Self {
            http,
            url,
            compression,
        })
    }

    /// The configured URL with its `query` parameter replaced by the insert
    /// statement. Other parameters (credentials, settings) are kept.
    pub(crate) fn insert_url(&self, table: &str) -> Url {
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != "query")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut url = self.url.clone();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("query", &format!("INSERT INTO {table} FORMAT RowBinary"));
        url
    }

    /// Run `produce` on a blocking thread and stream what it writes as the
    /// body of an insert into `table`. Returns what `produce` returned and
    /// the number of bytes it wrote, before compression.
    ///
    /// A failing `produce` aborts the request so the store never commits a
    /// partial body.
    pub(crate) async fn insert<F, T>(&self, table: &str, produce: F) -> Result<(T, u64)>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(BODY_QUEUE);
        let compression = self.compression;
        let producer = tokio::task::spawn_blocking(move || {
            let abort = tx.clone();
            let produced = produce_body(tx, compression, produce);
            if let Err(e) = &produced {
                let _ = abort.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
            }
            produced
        });

        let mut request = self
            .http
            .post(self.insert_url(table))
            .body(reqwest::Body::wrap_stream(BodyStream(rx)));
        if compression == Compression::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        let sent = send(request).await;

        let produced = producer
            .await
            .map_err(|e| Error::Read(io::Error::other(e.to_string())))?;
        match (sent, produced) {
            // the request was cut short by the transform, not the other way around
            (_, Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => Err(Error::Read(e)),
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(Error::Read(e)),
            (Ok(()), Ok(value)) => Ok(value),
        }
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<()> {
    let response = request.send().await.map_err(Error::Request)?;
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(());
    }

    let body = response.bytes().await.unwrap_or_default();
    let body = &body[..body.len().min(ERROR_BODY_LIMIT)];
    Err(Error::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

fn produce_body<F, T>(
    tx: mpsc::Sender<io::Result<Bytes>>,
    compression: Compression,
    produce: F,
) -> io::Result<(T, u64)>
where
    F: FnOnce(&mut dyn Write) -> io::Result<T>,
{
    let body = BodyWriter::new(tx);
    match compression {
        Compression::None => {
            let mut out = Counting::new(body);
            let value = produce(&mut out)?;
            out.flush()?;
            Ok((value, out.bytes))
        }
        Compression::Gzip => {
            let mut out = Counting::new(GzEncoder::new(body, flate2::Compression::default()));
            let value = produce(&mut out)?;
            out.inner.finish()?.flush()?;
            Ok((value, out.bytes))
        }
    }
}

#[derive(Debug)]
struct Counting<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Counting<W> {
    fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }
}

impl<W: Write> Write for Counting<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes into the request body in [`CHUNK_SIZE`] pieces.
#[derive(Debug)]
struct BodyWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl BodyWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request closed"))
    }
}

impl Write for BodyWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.send()
    }
}

#[derive(Debug)]
struct BodyStream(mpsc::Receiver<io::Result<Bytes>>);

impl futures::Stream for BodyStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use std::io::Read;

    #[test]
    fn insert_url_keeps_parameters() {
        let client = Client::new(
            "http://localhost:8123/?user=carbon&query=SELECT+1",
            Duration::from_secs(1),
            Compression::None,
            None,
        )
        .unwrap();
        let url = client.insert_url("graphite");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("user".to_string(), "carbon".to_string()),
                (
                    "query".to_string(),
                    "INSERT INTO graphite FORMAT RowBinary".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn streams_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::UrlEncoded(
                "query".into(),
                "INSERT INTO graphite (Path) FORMAT RowBinary".into(),
            ))
            .match_body(vec![1u8; CHUNK_SIZE + 10])
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(&server.url(), Duration::from_secs(5), Compression::None, None).unwrap();
        let (records, bytes) = client
            .insert("graphite (Path)", |out| {
                out.write_all(&[1u8; CHUNK_SIZE])?;
                out.write_all(&[1u8; 10])?;
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(records, 2);
        assert_eq!(bytes, CHUNK_SIZE as u64 + 10);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn gzip_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .match_header("content-encoding", "gzip")
            .match_request(|request| {
                let mut decoded = String::new();
                GzDecoder::new(request.body().unwrap().as_slice())
                    .read_to_string(&mut decoded)
                    .unwrap();
                decoded == "compressed rows"
            })
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(&server.url(), Duration::from_secs(5), Compression::Gzip, None).unwrap();
        let ((), bytes) = client
            .insert("t", |out| out.write_all(b"compressed rows"))
            .await
            .unwrap();
        assert_eq!(bytes, 15);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_keeps_body() {
        let mut server = Server::new_async().await;
        let long = "x".repeat(4096);
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(format!("Code: 33. DB::Exception: Cannot read all data. {long}"))
            .create_async()
            .await;

        let client = Client::new(&server.url(), Duration::from_secs(5), Compression::None, None).unwrap();
        let err = client
            .insert("t", |out| out.write_all(b"rows"))
            .await
            .unwrap_err();
        match &err {
            Error::Status { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body.len(), ERROR_BODY_LIMIT);
                assert!(body.contains("Cannot read all data"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().starts_with("clickhouse response status 500: Code: 33."));
    }

    #[tokio::test]
    async fn transform_errors_win() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(&server.url(), Duration::from_secs(5), Compression::None, None).unwrap();
        let err = client
            .insert("t", |_out| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Read(e) if e.kind() == io::ErrorKind::NotFound));
    }
}
