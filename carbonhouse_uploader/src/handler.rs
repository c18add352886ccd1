//! The seam between the upload loop and the per-kind row producers.

use std::{
    fmt::Debug,
    io::{self, BufRead, Write},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use carbonhouse_rowbinary::{ReadError, Reader, Record};
use hashbrown::HashSet;
use tracing::warn;

use crate::{Result, client::Client, cmap::CMap};

/// Outcome of one accepted file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Uploaded {
    /// Names (or records, for points) sent.
    pub(crate) metrics: u64,
    /// Body bytes before compression.
    pub(crate) bytes: u64,
}

/// Uploads a single stage file.
#[async_trait]
pub(crate) trait Handler: Debug + Send + Sync {
    async fn upload(&self, path: &Path) -> Result<Uploaded>;
}

/// What a [`Transform`] wrote for one file.
#[derive(Debug, Default)]
pub(crate) struct Transformed {
    pub(crate) metrics: u64,
    /// Cache keys seen for the first time in this file.
    pub(crate) new_keys: HashSet<String>,
}

/// Turns a stage file into table rows, skipping keys already in the cache.
///
/// Runs on a blocking thread.
pub(crate) trait Transform: Debug + Send + Sync + 'static {
    fn transform(&self, path: &Path, cache: &CMap, out: &mut dyn Write) -> io::Result<Transformed>;
}

/// A [`Transform`] whose new keys are committed to the cache once the store
/// accepted them.
#[derive(Debug)]
pub(crate) struct Cached<T> {
    client: Client,
    query: String,
    transform: Arc<T>,
    cache: Arc<CMap>,
}

impl<T: Transform> Cached<T> {
    pub(crate) fn new(client: Client, query: String, transform: T, cache: Arc<CMap>) -> Self {
        Self {
            client,
            query,
            transform: Arc::new(transform),
            cache,
        }
    }
}

#[async_trait]
impl<T: Transform> Handler for Cached<T> {
    async fn upload(&self, path: &Path) -> Result<Uploaded> {
        let started = chrono::Utc::now().timestamp();
        let transform = Arc::clone(&self.transform);
        let cache = Arc::clone(&self.cache);
        let path = path.to_path_buf();

        let (transformed, bytes) = self
            .client
            .insert(&self.query, move |out| {
                transform.transform(&path, &cache, out)
            })
            .await?;

        self.cache.merge(transformed.new_keys, started);
        Ok(Uploaded {
            metrics: transformed.metrics,
            bytes,
        })
    }
}

/// Call `f` with every record of `reader`. A malformed or truncated record
/// ends the file without an error, since everything before it is usable.
pub(crate) fn each_record<R, F>(reader: &mut Reader<R>, path: &Path, mut f: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(Record<'_>) -> io::Result<()>,
{
    loop {
        match reader.read_record() {
            Ok(Some(record)) => f(record)?,
            Ok(None) => return Ok(()),
            Err(ReadError::Io(e)) => return Err(e),
            Err(error) => {
                warn!(path = %path.display(), %error, "stopping at malformed record");
                return Ok(());
            }
        }
    }
}
