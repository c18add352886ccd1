//! Self-metrics.
//!
//! Every `metric-interval` the collector asks each registered module for its
//! counters and publishes them as `<prefix>.<module>.<metric>`, either into
//! the agent's own write channel or as plain text to a carbon endpoint.

use std::{fmt::Write as _, io, net::SocketAddr, sync::Arc, time::Duration};

use carbonhouse_receiver::Receiver;
use carbonhouse_rowbinary::{PointWriter, WriteSink, now_secs};
use carbonhouse_uploader::Uploader;
use carbonhouse_writer::Writer;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MetricEndpoint;

const TCP_CHUNK_SIZE: usize = 32768;
/// Fits a single datagram on any sane MTU.
const UDP_CHUNK_SIZE: usize = 1000;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Anything that reports counters.
pub trait StatModule: std::fmt::Debug + Send + Sync {
    fn stat(&self, send: &mut dyn FnMut(&str, f64));
}

impl StatModule for Writer {
    fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        Writer::stat(self, send)
    }
}

impl StatModule for Uploader {
    fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        Uploader::stat(self, send)
    }
}

impl StatModule for Receiver {
    fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        Receiver::stat(self, send)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub metric: String,
    pub value: f64,
    pub timestamp: u32,
}

#[derive(Debug)]
pub struct Collector {
    prefix: String,
    interval: Duration,
    endpoint: MetricEndpoint,
    sink: WriteSink,
    modules: Vec<(String, Arc<dyn StatModule>)>,
}

impl Collector {
    /// `sink` is only used with [`MetricEndpoint::Local`].
    pub fn new(
        prefix: impl Into<String>,
        interval: Duration,
        endpoint: MetricEndpoint,
        sink: WriteSink,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            interval,
            endpoint,
            sink,
            modules: vec![],
        }
    }

    pub fn register(&mut self, name: impl Into<String>, module: Arc<dyn StatModule>) {
        self.modules.push((name.into(), module));
    }

    /// Current counters of every module.
    pub fn collect(&self) -> Vec<Point> {
        let timestamp = now_secs();
        let mut points = vec![];
        for (module, stat) in &self.modules {
            stat.stat(&mut |metric, value| {
                let metric = format!("{}.{module}.{metric}", self.prefix);
                debug!(%metric, value, "stat");
                points.push(Point {
                    metric,
                    value,
                    timestamp,
                });
            });
        }
        points
    }

    /// Collect and send every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(endpoint = ?self.endpoint, interval = ?self.interval, "collector started");
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let points = self.collect();
                    self.send(&points, &shutdown).await;
                }
            }
        }
        info!("collector stopped");
    }

    async fn send(&self, points: &[Point], shutdown: &CancellationToken) {
        if points.is_empty() {
            return;
        }
        match &self.endpoint {
            MetricEndpoint::Local => {
                let mut writer = PointWriter::new(&self.sink, shutdown.clone());
                for p in points {
                    if let Err(error) = writer
                        .write_point(p.metric.as_bytes(), p.value, p.timestamp)
                        .await
                    {
                        warn!(%error, "unable to store self-metrics");
                        return;
                    }
                }
                if let Err(error) = writer.flush().await {
                    warn!(%error, "unable to store self-metrics");
                }
            }
            MetricEndpoint::Tcp(addr) => {
                for chunk in plain_chunks(points, TCP_CHUNK_SIZE) {
                    send_with_retry(addr, &chunk, false, shutdown).await;
                }
            }
            MetricEndpoint::Udp(addr) => {
                for chunk in plain_chunks(points, UDP_CHUNK_SIZE) {
                    send_with_retry(addr, &chunk, true, shutdown).await;
                }
            }
        }
    }
}

/// `metric value timestamp\n` lines, grouped into chunks of at most
/// `chunk_size` bytes unless a single line is larger.
fn plain_chunks(points: &[Point], chunk_size: usize) -> Vec<String> {
    let mut chunks = vec![];
    let mut current = String::new();
    let mut line = String::new();
    for p in points {
        line.clear();
        // writing to a String cannot fail
        let _ = writeln!(line, "{} {} {}", p.metric, p.value, p.timestamp);
        if !current.is_empty() && current.len() + line.len() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn send_with_retry(addr: &str, chunk: &str, udp: bool, shutdown: &CancellationToken) {
    loop {
        let sent = tokio::time::timeout(SEND_TIMEOUT, send_chunk(addr, chunk.as_bytes(), udp))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")));
        match sent {
            Ok(()) => return,
            Err(error) => warn!(%addr, %error, "unable to send self-metrics"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
        }
    }
}

async fn send_chunk(addr: &str, chunk: &[u8], udp: bool) -> io::Result<()> {
    if udp {
        let target = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(chunk, target).await?;
    } else {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(chunk).await?;
        stream.shutdown().await?;
    }
    Ok(())
}
