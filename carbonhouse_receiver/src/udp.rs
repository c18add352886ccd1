//! Plain-text over UDP, one or more complete lines per datagram.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, warn};

use crate::{
    Base, Error, Result,
    plain::{Chunk, parser},
    stat::Stat,
};

const MAX_DATAGRAM: usize = 65_536;

pub(crate) async fn listen(
    base: &Arc<Base>,
    addr: SocketAddr,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Bind {
        protocol: base.protocol,
        addr,
        source,
    })?;
    let local_addr = socket.local_addr().map_err(|source| Error::Bind {
        protocol: base.protocol,
        addr,
        source,
    })?;

    let (tx, rx) = mpsc::channel::<Chunk>(base.options.parse_threads.max(1));
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..base.options.parse_threads.max(1) {
        tasks.spawn(parser(Arc::clone(base), Arc::clone(&rx)));
    }

    tasks.spawn(receive(Arc::clone(base), socket, tx, shutdown.clone()));
    Ok(local_addr)
}

async fn receive(
    base: Arc<Base>,
    socket: UdpSocket,
    tx: mpsc::Sender<Chunk>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(received) => received,
            Err(error) => {
                base.stats.incr(Stat::Errors);
                error!(%error, "receive failed");
                continue;
            }
        };
        let datagram = &buf[..n];
        let complete = datagram
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |last| last + 1);
        if complete < n {
            base.stats.incr(Stat::IncompleteReceived);
            if base.options.log_incomplete {
                warn!(
                    %peer,
                    line = %String::from_utf8_lossy(&datagram[complete..]),
                    "incomplete message"
                );
            }
        }
        if complete > 0 {
            let chunk = Chunk {
                data: Bytes::copy_from_slice(&datagram[..complete]),
                time: carbonhouse_rowbinary::now_secs(),
            };
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Options, Protocol, Receiver, test_util};

    #[tokio::test]
    async fn datagrams() {
        let (sink, mut rx) = test_util::sink();
        let receiver = Receiver::start(
            Protocol::Udp,
            "127.0.0.1:0".parse().unwrap(),
            Options::default(),
            sink,
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"a.b 1 1559465760\nhello.world 2 155946", receiver.local_addr())
            .await
            .unwrap();

        let points = test_util::collect(&mut rx, 1).await;
        assert_eq!(points[0].name, "a.b");
        assert_eq!(points[0].timestamp, 1559465760);

        receiver.shutdown();
        receiver.join().await;
        assert_eq!(receiver.stats().get(Stat::IncompleteReceived), 1);
        assert_eq!(receiver.stats().get(Stat::MetricsReceived), 1);
    }
}
