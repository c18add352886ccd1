//! Wires the components together and runs them until shutdown.

use std::{net::SocketAddr, sync::Arc};

use carbonhouse_receiver::{Options, Protocol, Receiver};
use carbonhouse_rowbinary::WriteSink;
use carbonhouse_shutdown::{ShutdownManager, Stage};
use carbonhouse_uploader::{InProgress, Uploader};
use carbonhouse_writer::Writer;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    collector::{Collector, StatModule},
    config::{self, Config},
    debug::{self, DebugState},
};

/// Buffers queued between the receivers and the writer.
const WRITE_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(#[from] config::Error),

    #[error("unable to start the stage writer: {0}")]
    Writer(#[from] carbonhouse_writer::Error),

    #[error("unable to start uploader {name}: {source}")]
    Uploader {
        name: String,
        #[source]
        source: carbonhouse_uploader::Error,
    },

    #[error("unable to start {protocol} receiver: {source}")]
    Receiver {
        protocol: Protocol,
        #[source]
        source: carbonhouse_receiver::Error,
    },

    #[error(transparent)]
    Debug(#[from] debug::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The running agent.
#[derive(Debug)]
pub struct App {
    manager: ShutdownManager,
    writer: Arc<Writer>,
    uploaders: Vec<Arc<Uploader>>,
    receivers: Vec<Arc<Receiver>>,
    debug_addr: Option<SocketAddr>,
}

impl App {
    /// Start the writer, the uploaders, the receivers, the collector and
    /// the debug server, in that order.
    ///
    /// `parse_threads` is the number of plain-text parsers behind each TCP
    /// and UDP listener.
    pub async fn start(config: &Config, parse_threads: usize) -> Result<Self> {
        let manager = ShutdownManager::new();
        let metric_endpoint = config.metric_endpoint()?;
        let tags = Arc::new(config.convert_to_tagged.compile().map_err(config::Error::from)?);

        let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);

        let writer_token = manager.register(Stage::Writer);
        let writer = match Writer::start(
            carbonhouse_writer::Config {
                path: config.data.path.clone(),
                tables: config.tables(),
                chunk_interval: config.data.chunk_interval,
                chunk_auto_interval: config.data.chunk_auto_interval.clone(),
                chunk_max_size: config.data.chunk_max_size,
                compression: config.data.compression,
                compression_level: config.data.compression_level,
            },
            rx,
            writer_token.cancellation(),
        )
        .await
        {
            Ok(writer) => writer,
            Err(e) => {
                writer_token.complete();
                return Err(e.into());
            }
        };
        {
            let writer = Arc::clone(&writer);
            let token = writer_token.clone();
            tokio::spawn(async move {
                token.wait_for_shutdown().await;
                writer.join().await;
                token.complete();
            });
        }
        let sink = WriteSink::new(tx, writer_token.cancellation());

        let mut uploaders = Vec::with_capacity(config.upload.len());
        for (name, upload) in &config.upload {
            let in_progress: InProgress = {
                let writer = Arc::clone(&writer);
                Arc::new(move |file_name: &str| writer.is_in_progress(file_name))
            };
            match Uploader::new(name, &config.data.path, upload.clone(), in_progress) {
                Ok(uploader) => uploaders.push(uploader),
                Err(source) => {
                    manager.shutdown().await;
                    return Err(Error::Uploader {
                        name: name.clone(),
                        source,
                    });
                }
            }
        }
        let uploaders_token = manager.register(Stage::Uploaders);
        for uploader in &uploaders {
            uploader.start(uploaders_token.cancellation());
        }
        {
            let uploaders = uploaders.clone();
            let token = uploaders_token.clone();
            tokio::spawn(async move {
                token.wait_for_shutdown().await;
                futures::future::join_all(uploaders.iter().map(|u| u.join())).await;
                info!("uploaders stopped");
                token.complete();
            });
        }

        let defaults = Options {
            parse_threads,
            tags,
            ..Default::default()
        };
        let mut receivers: Vec<Arc<Receiver>> = vec![];
        for receiver in config.receivers() {
            if !receiver.enabled() {
                continue;
            }
            let started = match receiver.listen_addr() {
                Ok(addr) => Receiver::start(
                    receiver.protocol(),
                    addr,
                    receiver.options(&defaults),
                    sink.clone(),
                )
                .await
                .map_err(|source| Error::Receiver {
                    protocol: receiver.protocol(),
                    source,
                }),
                Err(e) => Err(e.into()),
            };
            match started {
                Ok(r) => receivers.push(Arc::new(r)),
                Err(e) => {
                    for r in &receivers {
                        r.shutdown();
                    }
                    manager.shutdown().await;
                    return Err(e);
                }
            }
        }
        let receivers_token = manager.register(Stage::Receivers);
        {
            let receivers = receivers.clone();
            let token = receivers_token.clone();
            tokio::spawn(async move {
                token.wait_for_shutdown().await;
                for r in &receivers {
                    r.shutdown();
                }
                futures::future::join_all(receivers.iter().map(|r| r.join())).await;
                token.complete();
            });
        }

        let mut collector = Collector::new(
            config.common.metric_prefix.clone(),
            config.common.metric_interval,
            metric_endpoint,
            sink,
        );
        collector.register("writer", Arc::clone(&writer) as Arc<dyn StatModule>);
        for r in &receivers {
            collector.register(r.protocol().name(), Arc::clone(r) as Arc<dyn StatModule>);
        }
        for u in &uploaders {
            collector.register(format!("upload.{}", u.name()), Arc::clone(u) as Arc<dyn StatModule>);
        }
        let collector_token = manager.register(Stage::Collector);
        {
            let token = collector_token.clone();
            tokio::spawn(async move {
                collector.run(token.cancellation()).await;
                token.complete();
            });
        }

        let mut app = Self {
            manager,
            writer,
            uploaders,
            receivers,
            debug_addr: None,
        };

        if config.debug.enabled {
            let state = Arc::new(DebugState {
                receivers: app.receivers.clone(),
                uploaders: app.uploaders.clone(),
            });
            let started = match config.debug.listen_addr() {
                Ok(addr) => debug::serve(addr, state, collector_token.cancellation())
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e.into()),
            };
            match started {
                Ok((addr, server)) => {
                    let token = app.manager.register(Stage::Collector);
                    tokio::spawn(async move {
                        server.await;
                        token.complete();
                    });
                    app.debug_addr = Some(addr);
                }
                Err(e) => {
                    app.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!(
            stage_dir = %config.data.path.display(),
            receivers = app.receivers.len(),
            uploaders = app.uploaders.len(),
            "carbonhouse started"
        );
        Ok(app)
    }

    pub fn writer(&self) -> &Arc<Writer> {
        &self.writer
    }

    pub fn uploaders(&self) -> &[Arc<Uploader>] {
        &self.uploaders
    }

    pub fn receivers(&self) -> &[Arc<Receiver>] {
        &self.receivers
    }

    pub fn receiver(&self, protocol: Protocol) -> Option<&Arc<Receiver>> {
        self.receivers.iter().find(|r| r.protocol() == protocol)
    }

    /// Bound address of the debug server when it is enabled.
    pub fn debug_addr(&self) -> Option<SocketAddr> {
        self.debug_addr
    }

    /// Make every cached uploader forget what it uploaded.
    pub fn reset(&self) {
        info!("resetting uploader caches");
        for uploader in &self.uploaders {
            uploader.reset();
        }
    }

    /// Completes when a component asked for the agent to stop.
    pub async fn requested(&self) {
        self.manager.requested().await;
    }

    /// Stop the receivers, let the writer drain the queue and close its
    /// file, then stop the uploaders and the collector.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

/// Run the agent until a termination signal. `SIGUSR1` resets the uploader
/// caches.
pub async fn run(config: &Config, parse_threads: usize) -> Result<()> {
    let app = App::start(config, parse_threads).await?;

    #[cfg(unix)]
    let mut reset = match carbonhouse_shutdown::CacheResetSignal::new() {
        Ok(signal) => Some(signal),
        Err(error) => {
            error!(%error, "unable to listen for SIGUSR1, cache reset disabled");
            None
        }
    };
    #[cfg(not(unix))]
    let mut reset: Option<()> = None;

    loop {
        tokio::select! {
            res = carbonhouse_shutdown::wait_for_signal() => {
                if let Err(error) = res {
                    error!(%error, "unable to listen for shutdown signals");
                }
                break;
            }
            _ = app.requested() => {
                info!("shutdown requested");
                break;
            }
            _ = cache_reset(&mut reset) => app.reset(),
        }
    }

    app.shutdown().await;
    Ok(())
}

/// Completes on every `SIGUSR1`; never once the signal stream ended.
#[cfg(unix)]
async fn cache_reset(signal: &mut Option<carbonhouse_shutdown::CacheResetSignal>) {
    if let Some(s) = signal {
        if s.recv().await.is_some() {
            return;
        }
    }
    *signal = None;
    futures::future::pending().await
}

#[cfg(not(unix))]
async fn cache_reset(_signal: &mut Option<()>) {
    futures::future::pending().await
}
