//! # Stage writer
//!
//! A single task drains the write channel into `default.<nanos>` files in the
//! stage directory, or `default.<nanos>.lz4` LZ4 frames when compression is
//! on. Every chunk interval the open file is closed and fanned
//! out into one subdirectory per upload table as a relative symlink; the
//! uploaders rename their link to `_default.<nanos>` after a successful upload
//! and the cleaner removes the file once every table has done so.
//!
//! # Constraints
//!
//! Only one `Writer` may own a stage directory. Files are never rewritten
//! once rotated, so a crash can at worst leave a truncated tail, which the
//! row-binary reader tolerates.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use carbonhouse_rowbinary::{LZ4_EXTENSION, WriteBuffer};
use hashbrown::HashSet;
use lz4_flex::frame::{BlockSize, FrameEncoder, FrameInfo};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

pub mod cleanup;
pub mod interval;
pub mod link;

pub use cleanup::cleanup_file;
pub use interval::AutoInterval;
pub use link::{finished_name, link};

/// How often the open file is checked against `chunk-max-size` and the
/// backlog-dependent interval.
const ROTATE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Delay between attempts to create a stage file.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const OUTPUT_BUFFER_SIZE: usize = 1024 * 1024;

/// Prefix of every stage file name.
pub const STAGE_FILE_PREFIX: &str = "default.";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unable to create directory {}: {source}", path.display()))]
    CreateDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("unable to read directory {}: {source}", path.display()))]
    ReadDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("unable to link {}: {source}", path.display()))]
    CreateLink { source: io::Error, path: PathBuf },

    #[snafu(display("unable to remove {}: {source}", path.display()))]
    RemoveFile { source: io::Error, path: PathBuf },

    #[snafu(display("not a stage file path: {}", path.display()))]
    InvalidFileName { path: PathBuf },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether `file_name` names a pending stage file (or a pending reference).
pub fn is_stage_file(file_name: &str) -> bool {
    file_name.starts_with(STAGE_FILE_PREFIX)
}

/// Encoding of stage files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// LZ4 frames with 4 MiB blocks.
    Lz4,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Stage directory.
    pub path: PathBuf,
    /// Names of the per-table subdirectories files are fanned out to.
    pub tables: Vec<String>,
    pub chunk_interval: Duration,
    /// Replaces `chunk_interval` while enough files wait for upload.
    pub chunk_auto_interval: AutoInterval,
    /// Rotate early once the open file reaches this size. Zero disables it.
    pub chunk_max_size: u64,
    pub compression: Compression,
    /// Only the fast LZ4 compressor exists, so levels above zero are
    /// accepted but compress the same.
    pub compression_level: u32,
}

/// The file currently being appended to.
#[derive(Debug)]
struct Chunk {
    name: String,
    path: PathBuf,
    out: BufWriter<File>,
    /// Compressed bytes collect in the encoder's vector until they are
    /// moved to `out`.
    lz4: Option<FrameEncoder<Vec<u8>>>,
    /// Uncompressed bytes written.
    size: u64,
    started: Instant,
}

impl Chunk {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.lz4 {
            Some(encoder) => {
                encoder.write_all(data)?;
                drain(encoder, &mut self.out).await
            }
            None => self.out.write_all(data).await,
        }
    }

    /// Push everything appended so far to the OS.
    async fn flush(&mut self) -> io::Result<()> {
        if let Some(encoder) = &mut self.lz4 {
            encoder.flush()?;
            drain(encoder, &mut self.out).await?;
        }
        self.out.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.lz4.take() {
            let rest = encoder.finish().map_err(io::Error::from)?;
            self.out.write_all(&rest).await?;
        }
        self.out.shutdown().await
    }
}

async fn drain(encoder: &mut FrameEncoder<Vec<u8>>, out: &mut BufWriter<File>) -> io::Result<()> {
    let compressed = encoder.get_mut();
    if !compressed.is_empty() {
        out.write_all(compressed).await?;
        compressed.clear();
    }
    Ok(())
}

#[derive(Debug)]
pub struct Writer {
    config: Config,
    in_progress: RwLock<HashSet<String>>,
    last_nanos: Mutex<u128>,
    written_bytes: AtomicU64,
    unhandled: AtomicU64,
    tasks: TaskTracker,
}

impl Writer {
    /// Prepare the stage directory, recover files left by a previous run and
    /// start the write loop and the periodic cleaner.
    ///
    /// The loop drains `rx` until `shutdown` is cancelled, then writes out
    /// whatever is still queued and closes the open file.
    pub async fn start(
        config: Config,
        rx: mpsc::Receiver<WriteBuffer>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        info!(
            stage_dir = %config.path.display(),
            tables = ?config.tables,
            compression = ?config.compression,
            "initializing stage writer"
        );
        if config.compression == Compression::Lz4 && config.compression_level > 0 {
            warn!(
                level = config.compression_level,
                "lz4 compression levels are not supported, using the fast compressor"
            );
        }
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(CreateDirectorySnafu { path: &config.path })?;

        let writer = Arc::new(Self {
            config,
            in_progress: Default::default(),
            last_nanos: Default::default(),
            written_bytes: Default::default(),
            unhandled: Default::default(),
            tasks: TaskTracker::new(),
        });

        writer.link_all()?;
        writer.cleanup()?;

        writer
            .tasks
            .spawn(Arc::clone(&writer).worker(rx, shutdown.clone()));
        writer.tasks.spawn(Arc::clone(&writer).cleaner(shutdown));
        writer.tasks.close();
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether `file_name` is the file currently being written.
    pub fn is_in_progress(&self, file_name: &str) -> bool {
        self.in_progress.read().contains(file_name)
    }

    /// Report counters; `writtenBytes` is reset on every report.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        send(
            "writtenBytes",
            self.written_bytes.swap(0, Ordering::Relaxed) as f64,
        );
        send("unhandled", self.unhandled.load(Ordering::Relaxed) as f64);
        send("chunkInterval_s", self.chunk_interval().as_secs_f64());
    }

    /// Rotation interval for the current upload backlog.
    pub fn chunk_interval(&self) -> Duration {
        self.config.chunk_auto_interval.interval(
            self.unhandled.load(Ordering::Relaxed),
            self.config.chunk_interval,
        )
    }

    /// Wait for the write loop and the cleaner to exit.
    pub async fn join(&self) {
        self.tasks.wait().await;
        info!("stage writer stopped");
    }

    /// Strictly increasing file name, even for two files opened in the same
    /// nanosecond.
    fn next_file_name(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut last = self.last_nanos.lock();
        *last = now.max(*last + 1);
        let extension = match self.config.compression {
            Compression::None => "",
            Compression::Lz4 => LZ4_EXTENSION,
        };
        format!("{STAGE_FILE_PREFIX}{last}{extension}")
    }

    async fn open_chunk(&self, shutdown: &CancellationToken) -> Option<Chunk> {
        loop {
            let name = self.next_file_name();
            let path = self.config.path.join(&name);
            self.in_progress.write().insert(name.clone());

            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(&path)
                .await;
            match opened {
                Ok(file) => {
                    let lz4 = match self.config.compression {
                        Compression::None => None,
                        Compression::Lz4 => Some(FrameEncoder::with_frame_info(
                            FrameInfo::new().block_size(BlockSize::Max4MB),
                            Vec::new(),
                        )),
                    };
                    return Some(Chunk {
                        name,
                        path,
                        out: BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, file),
                        lz4,
                        size: 0,
                        started: Instant::now(),
                    });
                }
                Err(e) => {
                    self.in_progress.write().remove(&name);
                    error!(file = %path.display(), %e, "create failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(OPEN_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    /// Flush and close `chunk`, then hand it to the uploaders.
    async fn finish_chunk(&self, mut chunk: Chunk) {
        if let Err(e) = chunk.close().await {
            error!(file = %chunk.path.display(), %e, "close failed");
        }
        info!(
            file = %chunk.path.display(),
            size = chunk.size,
            time = ?chunk.started.elapsed(),
            "chunk switched"
        );

        if let Err(e) = link(&chunk.path, &self.config.tables) {
            error!(file = %chunk.path.display(), %e, "fan-out failed");
        }
        self.in_progress.write().remove(&chunk.name);
    }

    fn over_max_size(&self, chunk: &Chunk) -> bool {
        let max_size = self.config.chunk_max_size;
        max_size > 0 && chunk.size >= max_size
    }

    async fn write(&self, chunk: &mut Chunk, mut wb: WriteBuffer) {
        let data = wb.as_bytes();
        let mut written = chunk.append(data).await;
        let len = data.len() as u64;

        if let Some(token) = wb.take_confirm() {
            if written.is_ok() {
                written = chunk.flush().await;
            }
            match &written {
                Ok(()) => token.confirm(),
                Err(e) => token.fail(e.to_string()),
            }
        }
        if let Err(e) = written {
            error!(file = %chunk.path.display(), %e, "write failed");
        }

        chunk.size += len;
        self.written_bytes.fetch_add(len, Ordering::Relaxed);
        wb.release();
    }

    async fn worker(self: Arc<Self>, mut rx: mpsc::Receiver<WriteBuffer>, shutdown: CancellationToken) {
        let Some(mut chunk) = self.open_chunk(&shutdown).await else {
            discard(&mut rx);
            return;
        };

        let mut ticker = tokio::time::interval(ROTATE_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut interval = self.chunk_interval();

        loop {
            let rotate = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(wb) => {
                        self.write(&mut chunk, wb).await;
                        if rx.is_empty() {
                            if let Err(e) = chunk.flush().await {
                                error!(file = %chunk.path.display(), %e, "flush failed");
                            }
                        }
                        false
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(chunk.started + interval) => true,
                _ = ticker.tick() => {
                    let next = self.chunk_interval();
                    if next != interval {
                        info!(interval = ?next, "chunk interval changed");
                        interval = next;
                    }
                    self.over_max_size(&chunk) || chunk.started.elapsed() >= interval
                }
            };

            if rotate {
                self.finish_chunk(chunk).await;
                match self.open_chunk(&shutdown).await {
                    Some(next) => chunk = next,
                    None => {
                        discard(&mut rx);
                        return;
                    }
                }
            }
        }

        // producers are gone or stopping; keep what they already queued
        rx.close();
        while let Some(wb) = rx.recv().await {
            self.write(&mut chunk, wb).await;
        }
        self.finish_chunk(chunk).await;
    }
}

fn discard(rx: &mut mpsc::Receiver<WriteBuffer>) {
    rx.close();
    let mut lost = 0;
    while rx.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        warn!(buffers = lost, "no stage file open, queued buffers lost");
    }
}
