//! `points` and `points-reverse`: the staged records are already in the
//! table's column order, so the file is streamed as it is whenever no
//! per-record work is configured.

use std::{
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use carbonhouse_rowbinary::{RECORD_TAIL_SIZE, Reader, StageFile};
use tracing::warn;

use crate::{
    Result,
    client::Client,
    config::{Config, Kind},
    filter::IgnoredPatterns,
    handler::{Handler, Uploaded, each_record},
};

#[derive(Debug)]
pub(crate) struct Points {
    client: Client,
    query: String,
    reverse: bool,
    zero_timestamp: bool,
    ignored: Arc<IgnoredPatterns>,
}

impl Points {
    pub(crate) fn new(client: Client, query: String, config: &Config) -> Self {
        Self {
            client,
            query,
            reverse: config.kind == Kind::PointsReverse,
            zero_timestamp: config.zero_timestamp,
            ignored: Arc::new(IgnoredPatterns::new(&config.ignored_patterns)),
        }
    }

    /// Whether the file bytes can be sent without decoding them.
    fn verbatim(&self) -> bool {
        !self.reverse && !self.zero_timestamp && self.ignored.is_empty()
    }

    async fn copy(&self, path: &Path) -> Result<Uploaded> {
        let path = path.to_path_buf();
        let (metrics, bytes) = self
            .client
            .insert(&self.query, move |out| {
                let mut file = StageFile::open(&path)?;
                let mut counter = RecordCounter::new(out);
                io::copy(&mut file, &mut counter)?;
                Ok(counter.records)
            })
            .await?;
        Ok(Uploaded { metrics, bytes })
    }

    async fn filtered(&self, path: &Path) -> Result<Uploaded> {
        let path = path.to_path_buf();
        let reverse = self.reverse;
        let zero_timestamp = self.zero_timestamp;
        let ignored = Arc::clone(&self.ignored);
        let (metrics, bytes) = self
            .client
            .insert(&self.query, move |out| {
                filter_file(&path, reverse, zero_timestamp, &ignored, out)
            })
            .await?;
        Ok(Uploaded { metrics, bytes })
    }
}

#[async_trait]
impl Handler for Points {
    async fn upload(&self, path: &Path) -> Result<Uploaded> {
        if !self.verbatim() {
            return self.filtered(path).await;
        }

        match self.copy(path).await {
            Err(e) if e.is_corrupt_input() => {
                warn!(path = %path.display(), error = %e, "retrying with only valid records");
                self.filtered(path).await
            }
            result => result,
        }
    }
}

/// Copy the valid records of a stage file, minus ignored names.
fn filter_file(
    path: &Path,
    reverse: bool,
    zero_timestamp: bool,
    ignored: &IgnoredPatterns,
    out: &mut dyn Write,
) -> io::Result<u64> {
    let mut reader = Reader::open(path, reverse)?.with_zero_version(zero_timestamp);
    let mut records = 0;
    each_record(&mut reader, path, |record| {
        if !ignored.is_empty() && !record.is_tagged() {
            let name = String::from_utf8_lossy(record.name);
            if ignored.contains(&name, reverse) {
                return Ok(());
            }
        }
        out.write_all(record.raw)?;
        records += 1;
        Ok(())
    })?;
    Ok(records)
}

/// Passes bytes through while counting the records framed in them.
struct RecordCounter<'a> {
    out: &'a mut dyn Write,
    records: u64,
    /// Bytes left in the current record after its length prefix.
    remaining: u64,
    len: u64,
    shift: u32,
}

impl<'a> RecordCounter<'a> {
    fn new(out: &'a mut dyn Write) -> Self {
        Self {
            out,
            records: 0,
            remaining: 0,
            len: 0,
            shift: 0,
        }
    }

    fn count(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.remaining > 0 {
                let n = self.remaining.min(data.len() as u64);
                self.remaining -= n;
                data = &data[n as usize..];
                continue;
            }

            let b = data[0];
            data = &data[1..];
            self.len |= u64::from(b & 0x7f).checked_shl(self.shift).unwrap_or(0);
            if b & 0x80 != 0 {
                self.shift = self.shift.saturating_add(7);
                continue;
            }

            self.records += 1;
            self.remaining = self.len + RECORD_TAIL_SIZE as u64;
            self.len = 0;
            self.shift = 0;
        }
    }
}

impl std::fmt::Debug for RecordCounter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCounter")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl Write for RecordCounter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.out.write(data)?;
        self.count(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
