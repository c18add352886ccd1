//! Scan and upload loops shared by every table kind.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

use crate::{
    FINISHED_PREFIX, PENDING_PREFIX, Result,
    client::Client,
    cmap::CMap,
    config::{Config, Kind},
    handler::{Cached, Handler},
    index::Index,
    points::Points,
    series::Series,
    tagged::Tagged,
};

const SCAN_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_SIZE: usize = 1024;

/// Pause after a failed upload before the worker takes the next file.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Whether the stage writer still has the named file open.
pub type InProgress = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct Stats {
    uploaded: AtomicU64,
    uploaded_metrics: AtomicU64,
    uploaded_bytes: AtomicU64,
    errors: AtomicU64,
    delay: AtomicU64,
    unhandled: AtomicU64,
    expired: AtomicU64,
}

/// Uploads the files referenced from one table directory.
pub struct Uploader {
    name: String,
    dir: PathBuf,
    config: Config,
    handler: Arc<dyn Handler>,
    cache: Option<Arc<CMap>>,
    in_progress: InProgress,
    /// File names handed to a worker and not finished yet.
    in_queue: Mutex<HashSet<String>>,
    stats: Stats,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Build the uploader for section `name`, reading references from
    /// `<stage_dir>/<name>`.
    pub fn new(
        name: impl Into<String>,
        stage_dir: &Path,
        mut config: Config,
        in_progress: InProgress,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        config.validate()?;
        if config.table.is_empty() {
            config.table.clone_from(&name);
        }

        let client = Client::new(
            &config.url,
            config.timeout,
            config.compression,
            config.tls.as_ref(),
        )?;
        let query = format!("{} {}", config.table, config.kind.columns());
        let (handler, cache): (Arc<dyn Handler>, _) = match config.kind {
            Kind::Points | Kind::PointsReverse => {
                (Arc::new(Points::new(client, query, &config)), None)
            }
            Kind::Series | Kind::SeriesReverse => {
                let series = Series::new(config.kind == Kind::SeriesReverse, config.hash);
                cached(client, query, series)
            }
            Kind::Index => {
                let index = Index::new(config.tree_date()?, config.hash, config.disable_daily_index);
                cached(client, query, index)
            }
            Kind::Tagged => {
                let tagged = Tagged::new(config.hash, &config.ignored_tagged_metrics);
                cached(client, query, tagged)
            }
        };

        Ok(Arc::new(Self {
            dir: stage_dir.join(&name),
            name,
            config,
            handler,
            cache,
            in_progress,
            in_queue: Default::default(),
            stats: Default::default(),
            tasks: TaskTracker::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the scanner, the upload workers and, for cached kinds with a
    /// ttl, the cache expiry. Everything stops once `shutdown` is cancelled;
    /// a worker finishes the file it is uploading first.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        self.tasks
            .spawn(Arc::clone(self).scanner(tx, shutdown.clone()));
        for _ in 0..self.config.threads {
            self.tasks
                .spawn(Arc::clone(self).worker(Arc::clone(&rx), shutdown.clone()));
        }

        if let Some(cache) = &self.cache {
            if !self.config.cache_ttl.is_zero() {
                let cache = Arc::clone(cache);
                let this = Arc::clone(self);
                let ttl = self.config.cache_ttl;
                self.tasks.spawn(async move {
                    cache
                        .expire_worker(ttl, &this.stats.expired, shutdown)
                        .await
                });
            }
        }
        self.tasks.close();
        info!(uploader = %self.name, kind = ?self.config.kind, table = %self.config.table, "uploader started");
    }

    /// Wait for every task spawned by [`Self::start`].
    pub async fn join(&self) {
        self.tasks.wait().await;
    }

    /// Report counters since the previous call; `delay`, `unhandled` and
    /// `cacheSize` are gauges.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        let s = &self.stats;
        send("uploaded", s.uploaded.swap(0, Ordering::Relaxed) as f64);
        send("uploadedMetrics", s.uploaded_metrics.swap(0, Ordering::Relaxed) as f64);
        send("uploadedBytes", s.uploaded_bytes.swap(0, Ordering::Relaxed) as f64);
        send("errors", s.errors.swap(0, Ordering::Relaxed) as f64);
        send("delay", s.delay.load(Ordering::Relaxed) as f64);
        send("unhandled", s.unhandled.load(Ordering::Relaxed) as f64);

        if let Some(cache) = &self.cache {
            send("cacheSize", cache.count() as f64);
            send("expired", s.expired.swap(0, Ordering::Relaxed) as f64);
        }
    }

    /// Entries in the dedup cache, `None` for kinds without one.
    pub fn cache_size(&self) -> Option<usize> {
        self.cache.as_ref().map(|c| c.count())
    }

    /// Forget every uploaded key so names are sent again.
    pub fn reset(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            info!(uploader = %self.name, "cache cleared");
        }
    }

    async fn scanner(self: Arc<Self>, queue: mpsc::Sender<String>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let files = match self.pending().await {
                Ok(files) => files,
                Err(error) => {
                    error!(uploader = %self.name, dir = %self.dir.display(), %error, "failed to scan table directory");
                    continue;
                }
            };

            for file in files {
                if (self.in_progress)(&file) || !self.in_queue.lock().insert(file.clone()) {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = queue.send(file) => if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Pending references in name order, updating `delay` and `unhandled`.
    async fn pending(&self) -> std::io::Result<Vec<String>> {
        let now = SystemTime::now();
        let mut delay = Duration::ZERO;
        let mut files = vec![];

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(PENDING_PREFIX) {
                continue;
            }
            // finished and renamed by a worker since read_dir listed it
            let Some(modified) = modified(&entry.path()).await? else {
                continue;
            };
            delay = delay.max(now.duration_since(modified).unwrap_or_default());
            files.push(name);
        }

        files.sort_unstable();
        self.stats.delay.store(delay.as_secs(), Ordering::Relaxed);
        self.stats
            .unhandled
            .store(files.len() as u64, Ordering::Relaxed);
        Ok(files)
    }

    async fn worker(
        self: Arc<Self>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let file = tokio::select! {
                _ = shutdown.cancelled() => return,
                file = async { queue.lock().await.recv().await } => match file {
                    Some(file) => file,
                    None => return,
                },
            };

            if !self.upload(&file).await {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
            self.in_queue.lock().remove(&file);
        }
    }

    /// Upload one referenced file, marking it finished on success.
    async fn upload(&self, file: &str) -> bool {
        let path = self.dir.join(file);
        let started = Instant::now();
        debug!(uploader = %self.name, file, "start handle");

        match self.handler.upload(&path).await {
            Ok(uploaded) => {
                self.stats.uploaded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .uploaded_metrics
                    .fetch_add(uploaded.metrics, Ordering::Relaxed);
                self.stats
                    .uploaded_bytes
                    .fetch_add(uploaded.bytes, Ordering::Relaxed);
                info!(
                    uploader = %self.name,
                    file,
                    metrics = uploaded.metrics,
                    bytes = uploaded.bytes,
                    elapsed = ?started.elapsed(),
                    "handle success"
                );

                let finished = self.dir.join(file.replacen(PENDING_PREFIX, FINISHED_PREFIX, 1));
                if let Err(error) = tokio::fs::rename(&path, &finished).await {
                    error!(uploader = %self.name, file, %error, "failed to mark file as finished");
                }
                true
            }
            Err(error) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    uploader = %self.name,
                    file,
                    %error,
                    elapsed = ?started.elapsed(),
                    "handle failed"
                );
                false
            }
        }
    }
}

/// Modification time of the reference itself, `None` once it is gone.
async fn modified(path: &Path) -> std::io::Result<Option<SystemTime>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta.modified().map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn cached<T: crate::handler::Transform>(
    client: Client,
    query: String,
    transform: T,
) -> (Arc<dyn Handler>, Option<Arc<CMap>>) {
    let cache = Arc::new(CMap::new());
    let handler = Cached::new(client, query, transform, Arc::clone(&cache));
    (Arc::new(handler), Some(cache))
}
