//! Plain-text over TCP.

use std::{net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, warn};

use crate::{
    Base, Error, Result,
    plain::{Chunk, parser},
    stat::Stat,
};

/// Receive buffer per connection. A line longer than this is cut.
pub const READ_BUFFER_SIZE: usize = 262_144;

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

    let (tx, rx) = mpsc::channel::<Chunk>(base.options.parse_threads.max(1));
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..base.options.parse_threads.max(1) {
        tasks.spawn(parser(Arc::clone(base), Arc::clone(&rx)));
    }

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
                            tx.clone(),
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

async fn handle_connection(
    base: Arc<Base>,
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Chunk>,
    shutdown: CancellationToken,
) {
    let _active = base.stats.active_guard();
    let read_timeout = base.options.read_timeout;
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        if buf.len() >= READ_BUFFER_SIZE {
            // no newline in a full buffer, hand it over and let the parser count it
            let data = buf.split().freeze();
            if !forward(&tx, data, &shutdown).await {
                break;
            }
        }
        buf.reserve(READ_BUFFER_SIZE - buf.len());

        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(read_timeout, stream.read_buf(&mut buf)) => read,
        };
        match read {
            Err(_) => {
                base.stats.incr(Stat::Errors);
                warn!(%peer, timeout = ?read_timeout, "read timed out");
                break;
            }
            Ok(Err(error)) => {
                base.stats.incr(Stat::Errors);
                error!(%peer, %error, "read failed");
                break;
            }
            Ok(Ok(0)) => {
                if !buf.is_empty() {
                    warn!(%peer, line = %String::from_utf8_lossy(&buf), "unfinished line");
                }
                break;
            }
            Ok(Ok(_)) => {}
        }

        if let Some(last) = buf.iter().rposition(|&b| b == b'\n') {
            let data = buf.split_to(last + 1).freeze();
            if !forward(&tx, data, &shutdown).await {
                break;
            }
        }
    }
}

/// Queue `data` for the parsers. False once the parsers are gone or
/// `shutdown` fires while they are busy.
async fn forward(tx: &mpsc::Sender<Chunk>, data: Bytes, shutdown: &CancellationToken) -> bool {
    let chunk = Chunk {
        data,
        time: carbonhouse_rowbinary::now_secs(),
    };
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Options, Protocol, Receiver, test_util};
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    #[test_log::test(tokio::test)]
    async fn three_samples() {
        let (sink, mut rx) = test_util::sink();
        let receiver = Receiver::start(
            Protocol::Tcp,
            "127.0.0.1:0".parse().unwrap(),
            Options::default(),
            sink,
        )
        .await
        .unwrap();

        let mut conn = TcpStream::connect(receiver.local_addr()).await.unwrap();
        // split mid-line to exercise the carried tail
        conn.write_all(b"a.b.c 1 1559465760\na.b.c 2 15594").await.unwrap();
        conn.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        conn.write_all(b"65761\nx.y 3 1559465762\n").await.unwrap();
        conn.shutdown().await.unwrap();

        let mut points = test_util::collect(&mut rx, 3).await;
        points.sort_by_key(|p| p.timestamp);
        assert_eq!(
            points
                .iter()
                .map(|p| (p.name.as_str(), p.value, p.timestamp))
                .collect::<Vec<_>>(),
            vec![
                ("a.b.c", 1.0, 1559465760),
                ("a.b.c", 2.0, 1559465761),
                ("x.y", 3.0, 1559465762),
            ]
        );

        receiver.shutdown();
        receiver.join().await;

        let mut stats = vec![];
        receiver.stat(&mut |name, value| stats.push((name.to_string(), value)));
        assert!(stats.contains(&("metricsReceived".to_string(), 3.0)));
        assert!(stats.contains(&("active".to_string(), 0.0)));
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_while_parsers_are_busy() {
        let (sink, _rx) = test_util::sink();
        let base = Arc::new(Base::new(Protocol::Tcp, Options::default(), sink));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        // a full queue nobody reads
        let (tx, _parsers) = mpsc::channel(1);
        tx.send(Chunk {
            data: Bytes::from_static(b"a 1 1\n"),
            time: 0,
        })
        .await
        .unwrap();

        let shutdown = CancellationToken::new();
        let handler = tokio::spawn(handle_connection(
            Arc::clone(&base),
            stream,
            peer,
            tx,
            shutdown.clone(),
        ));
        client.write_all(b"a.b.c 1 1559465760\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handler.is_finished());

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handler)
            .await
            .expect("connection closed on shutdown")
            .unwrap();

        assert_eq!(base.stats.get(Stat::Active), 0);
    }
}
