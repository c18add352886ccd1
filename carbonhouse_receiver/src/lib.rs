//! Network receivers.
//!
//! Each [`Receiver`] binds one listener, parses whatever arrives on it into
//! staged records and hands full buffers to the writer through a shared
//! [`WriteSink`]. Receivers never report parse failures upward; they count
//! them in their [`Stats`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use carbonhouse_rowbinary::WriteSink;
use carbonhouse_tags::TagRules;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

pub mod dropped;
pub mod grpc;
pub mod pickle;
pub mod plain;
pub mod prometheus;
mod server;
pub mod stat;
pub mod tcp;
pub mod telegraf;
pub mod udp;

pub use dropped::{DropFilter, DropReason, DroppedList};
pub use stat::{Stat, Stats};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {protocol} server: {source}")]
    Serve {
        protocol: Protocol,
        #[source]
        source: hyper::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Pickle,
    Grpc,
    Prometheus,
    TelegrafHttpJson,
}

impl Protocol {
    /// Name used for stats and debug URLs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Pickle => "pickle",
            Self::Grpc => "grpc",
            Self::Prometheus => "prometheus",
            Self::TelegrafHttpJson => "telegraf_http_json",
        }
    }

    fn stats(self) -> &'static [Stat] {
        use Stat::*;
        match self {
            Self::Tcp => &[
                MetricsReceived,
                Errors,
                Active,
                FutureDropped,
                PastDropped,
                TooLongDropped,
            ],
            Self::Udp => &[
                MetricsReceived,
                Errors,
                IncompleteReceived,
                FutureDropped,
                PastDropped,
                TooLongDropped,
            ],
            Self::Pickle => &[
                MessagesReceived,
                MetricsReceived,
                Errors,
                Active,
                FutureDropped,
                PastDropped,
                TooLongDropped,
            ],
            Self::Grpc => &[MetricsReceived, Errors],
            Self::Prometheus | Self::TelegrafHttpJson => &[
                SamplesReceived,
                Errors,
                FutureDropped,
                PastDropped,
                TooLongDropped,
            ],
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a receiver can be tuned with. Options a protocol has no use
/// for are ignored.
#[derive(Debug, Clone)]
pub struct Options {
    /// Plain-text parse workers behind TCP and UDP listeners.
    pub parse_threads: usize,
    pub drop_future: Duration,
    pub drop_past: Duration,
    pub drop_longer_than: usize,
    pub read_timeout: Duration,
    /// Telegraf: joins metric and field names.
    pub concat: String,
    /// HTTP receivers: largest accepted request body.
    pub max_message_size: usize,
    pub log_incomplete: bool,
    pub tags: Arc<TagRules>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parse_threads: num_cpus::get() * 2,
            drop_future: Duration::ZERO,
            drop_past: Duration::ZERO,
            drop_longer_than: 0,
            read_timeout: Duration::from_secs(120),
            concat: ".".to_string(),
            max_message_size: 67_108_864,
            log_incomplete: false,
            tags: Arc::new(TagRules::disabled()),
        }
    }
}

/// State shared by the tasks of one receiver.
#[derive(Debug)]
pub(crate) struct Base {
    pub(crate) protocol: Protocol,
    pub(crate) stats: Stats,
    pub(crate) dropped: DroppedList,
    pub(crate) filter: DropFilter,
    pub(crate) sink: WriteSink,
    pub(crate) options: Options,
}

impl Base {
    pub(crate) fn new(protocol: Protocol, options: Options, sink: WriteSink) -> Self {
        Self {
            protocol,
            stats: Stats::default(),
            dropped: DroppedList::default(),
            filter: DropFilter::new(
                options.drop_future,
                options.drop_past,
                options.drop_longer_than,
            ),
            sink,
            options,
        }
    }

    /// Apply the drop filter, counting and recording the sample when it is
    /// dropped.
    pub(crate) fn is_drop(&self, name: &[u8], now: u32, timestamp: u32, value: f64) -> bool {
        match self.filter.check(name.len(), now, timestamp) {
            None => false,
            Some(reason) => {
                self.stats.incr(reason.stat());
                self.dropped.push(name, now, timestamp, value);
                true
            }
        }
    }
}

/// A running listener.
#[derive(Debug)]
pub struct Receiver {
    base: Arc<Base>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Receiver {
    /// Bind `addr` and start serving `protocol` on it.
    ///
    /// Bind failures are returned; anything after that is logged and
    /// counted.
    pub async fn start(
        protocol: Protocol,
        addr: SocketAddr,
        options: Options,
        sink: WriteSink,
    ) -> Result<Self> {
        let base = Arc::new(Base::new(protocol, options, sink));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let local_addr = match protocol {
            Protocol::Tcp => tcp::listen(&base, addr, &shutdown, &tasks).await?,
            Protocol::Udp => udp::listen(&base, addr, &shutdown, &tasks).await?,
            Protocol::Pickle => pickle::listen(&base, addr, &shutdown, &tasks).await?,
            Protocol::Grpc => grpc::listen(&base, addr, &shutdown, &tasks).await?,
            Protocol::Prometheus => prometheus::listen(&base, addr, &shutdown, &tasks).await?,
            Protocol::TelegrafHttpJson => telegraf::listen(&base, addr, &shutdown, &tasks).await?,
        };
        tasks.close();
        info!(%protocol, %local_addr, "receiver started");

        Ok(Self {
            base,
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.base.protocol
    }

    /// Bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Stats {
        &self.base.stats
    }

    /// Report this receiver's counters, resetting them.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        self.base.stats.report(self.base.protocol.stats(), send);
    }

    /// Most recent dropped samples, sorted.
    pub fn dropped(&self) -> Vec<String> {
        self.base.dropped.sorted()
    }

    /// Stop accepting input. Data already received is still parsed and sent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every task of this receiver to finish.
    pub async fn join(&self) {
        self.tasks.wait().await;
        info!(protocol = %self.base.protocol, "receiver stopped");
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use carbonhouse_rowbinary::{Reader, WriteBuffer, WriteSink};
    use std::io::Cursor;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Point {
        pub(crate) name: String,
        pub(crate) value: f64,
        pub(crate) timestamp: u32,
    }

    pub(crate) fn sink() -> (WriteSink, mpsc::Receiver<WriteBuffer>) {
        let (tx, rx) = mpsc::channel(64);
        (WriteSink::new(tx, CancellationToken::new()), rx)
    }

    pub(crate) fn points(wb: &WriteBuffer) -> Vec<Point> {
        let mut reader = Reader::new(Cursor::new(wb.as_bytes().to_vec()), false);
        let mut out = vec![];
        while let Some(r) = reader.read_record().expect("valid record") {
            out.push(Point {
                name: String::from_utf8_lossy(r.name).into_owned(),
                value: r.value,
                timestamp: r.timestamp,
            });
        }
        out
    }

    /// Every point currently queued on the channel.
    pub(crate) fn drain(rx: &mut mpsc::Receiver<WriteBuffer>) -> Vec<Point> {
        let mut out = vec![];
        while let Ok(wb) = rx.try_recv() {
            out.extend(points(&wb));
        }
        out
    }

    /// Collect points until `n` have arrived.
    pub(crate) async fn collect(rx: &mut mpsc::Receiver<WriteBuffer>, n: usize) -> Vec<Point> {
        let mut out = vec![];
        while out.len() < n {
            let wb = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("points in time")
                .expect("channel open");
            out.extend(points(&wb));
        }
        out
    }
}
