//! Streaming reader for stage files.
//!
//! Stage files may be cut short by a crash, so every read error is terminal:
//! the first malformed or truncated record ends the stream and nothing after
//! it is ever returned.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian};
use lz4_flex::frame::FrameDecoder;
use thiserror::Error;

use crate::{
    LZ4_EXTENSION, RECORD_TAIL_SIZE, WRITE_BUFFER_SIZE,
    days::{date_string, timestamp_to_days},
    reverse::reverse_in_place,
    varint,
};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read record: {0}")]
    Io(#[from] io::Error),

    #[error("name length {0} exceeds the record limit")]
    NameTooLong(u64),

    #[error("name truncated: {0}")]
    NameTruncated(#[source] io::Error),

    #[error("record truncated: {0}")]
    RecordTruncated(#[source] io::Error),

    #[error("date and timestamp mismatch: days {days}, timestamp {timestamp}")]
    DateMismatch { days: u16, timestamp: u32 },
}

/// One decoded record, borrowing the reader's line buffer.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// The name as stored, or reversed when the reader is in reverse mode.
    pub name: &'a [u8],
    pub value: f64,
    pub timestamp: u32,
    pub days: u16,
    pub version: u32,
    /// The whole encoded record, including any reversal or zeroed version.
    pub raw: &'a [u8],
}

impl Record<'_> {
    /// `name` contains a `?`, i.e. it is a tagged series.
    pub fn is_tagged(&self) -> bool {
        self.name.contains(&b'?')
    }

    pub fn days_string(&self) -> String {
        date_string(self.days)
    }
}

#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    line: Vec<u8>,
    name_start: usize,
    offset: usize,
    eof: bool,
    reverse: bool,
    zero_version: bool,
}

/// An open stage file, decompressed on the fly when its name ends in
/// [`LZ4_EXTENSION`].
#[derive(Debug)]
pub enum StageFile {
    Plain(BufReader<File>),
    Lz4(FrameDecoder<File>),
}

impl StageFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let lz4 = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(LZ4_EXTENSION));
        Ok(if lz4 {
            Self::Lz4(FrameDecoder::new(file))
        } else {
            Self::Plain(BufReader::with_capacity(1 << 20, file))
        })
    }
}

impl Read for StageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
        }
    }
}

impl BufRead for StageFile {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            Self::Plain(r) => r.fill_buf(),
            Self::Lz4(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            Self::Plain(r) => r.consume(amt),
            Self::Lz4(r) => r.consume(amt),
        }
    }
}

impl Reader<StageFile> {
    /// Open a stage file. With `reverse`, untagged names come back with their
    /// dot segments reversed.
    pub fn open(path: impl AsRef<Path>, reverse: bool) -> io::Result<Self> {
        Ok(Self::new(StageFile::open(path.as_ref())?, reverse))
    }
}

impl<R: BufRead> Reader<R> {
    pub fn new(inner: R, reverse: bool) -> Self {
        Self {
            inner,
            line: Vec::with_capacity(1024),
            name_start: 0,
            offset: 0,
            eof: false,
            reverse,
            zero_version: false,
        }
    }

    /// Report every record's version as zero.
    pub fn with_zero_version(self, zero_version: bool) -> Self {
        Self {
            zero_version,
            ..self
        }
    }

    /// Next valid record, `Ok(None)` at end of stream.
    ///
    /// An error is returned at most once; afterwards the reader stays at EOF.
    pub fn read_record(&mut self) -> Result<Option<Record<'_>>, ReadError> {
        if self.eof {
            return Ok(None);
        }

        match self.fill_line() {
            Ok(true) => Ok(Some(self.record())),
            Ok(false) => {
                self.set_eof();
                Ok(None)
            }
            Err(e) => {
                self.set_eof();
                Err(e)
            }
        }
    }

    fn set_eof(&mut self) {
        self.eof = true;
        self.line.clear();
        self.offset = 0;
    }

    /// Read the next record into `line`. `Ok(false)` is a clean end of file.
    fn fill_line(&mut self) -> Result<bool, ReadError> {
        self.line.clear();
        self.offset = 0;

        let name_len = match varint::read_uvarint(&mut self.inner) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if name_len > WRITE_BUFFER_SIZE as u64 {
            return Err(ReadError::NameTooLong(name_len));
        }
        let name_len = name_len as usize;

        varint::put_uvarint(&mut self.line, name_len as u64);
        self.name_start = self.line.len();

        let total = self.name_start + name_len + RECORD_TAIL_SIZE;
        self.line.resize(total, 0);

        let name_end = self.name_start + name_len;
        self.inner
            .read_exact(&mut self.line[self.name_start..name_end])
            .map_err(ReadError::NameTruncated)?;
        self.inner
            .read_exact(&mut self.line[name_end..total])
            .map_err(ReadError::RecordTruncated)?;

        let name = &mut self.line[self.name_start..name_end];
        if self.reverse && !name.contains(&b'?') {
            reverse_in_place(name);
        }

        if self.zero_version {
            self.line[total - 4..total].fill(0);
        }

        let timestamp = LittleEndian::read_u32(&self.line[total - 10..total - 6]);
        let days = LittleEndian::read_u16(&self.line[total - 6..total - 4]);
        if days != timestamp_to_days(timestamp) {
            return Err(ReadError::DateMismatch { days, timestamp });
        }

        Ok(true)
    }

    fn record(&self) -> Record<'_> {
        let total = self.line.len();
        let tail = &self.line[total - RECORD_TAIL_SIZE..];
        Record {
            name: &self.line[self.name_start..total - RECORD_TAIL_SIZE],
            value: f64::from_bits(LittleEndian::read_u64(&tail[0..8])),
            timestamp: LittleEndian::read_u32(&tail[8..12]),
            days: LittleEndian::read_u16(&tail[12..14]),
            version: LittleEndian::read_u32(&tail[14..18]),
            raw: &self.line,
        }
    }
}

/// Streams the validated records back out in their encoded form.
impl<R: BufRead> Read for Reader<R> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while !buf.is_empty() {
            if self.offset < self.line.len() {
                let n = buf.len().min(self.line.len() - self.offset);
                buf[..n].copy_from_slice(&self.line[self.offset..self.offset + n]);
                self.offset += n;
                buf = &mut std::mem::take(&mut buf)[n..];
                read += n;
            } else if self.eof {
                break;
            } else {
                match self.fill_line() {
                    Ok(true) => {}
                    Ok(false) => self.set_eof(),
                    Err(error) => {
                        tracing::debug!(%error, "stopping at malformed record");
                        self.set_eof();
                    }
                }
            }
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_buffer::WriteBuffer;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn staged(points: &[(&str, f64, u32)]) -> Vec<u8> {
        let mut wb = WriteBuffer::acquire();
        for (name, value, ts) in points {
            wb.write_graphite_point(name.as_bytes(), *value, *ts, timestamp_to_days(*ts), 1000);
        }
        wb.as_bytes().to_vec()
    }

    #[test]
    fn reads_records() {
        let data = staged(&[("a.b.c", 1.0, 1559465760), ("x.y", 3.0, 1559465762)]);
        let mut reader = Reader::new(Cursor::new(data), false);

        let r = reader.read_record().unwrap().unwrap();
        assert_eq!(r.name, b"a.b.c");
        assert_eq!(r.value, 1.0);
        assert_eq!(r.timestamp, 1559465760);
        assert_eq!(r.days, 18049);
        assert_eq!(r.version, 1000);
        assert_eq!(r.days_string(), "2019-06-02");

        let r = reader.read_record().unwrap().unwrap();
        assert_eq!(r.name, b"x.y");
        assert!(reader.read_record().unwrap().is_none());
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn reverse_mode_skips_tagged() {
        let data = staged(&[("a.b.c", 1.0, 10), ("a.b?x=y", 2.0, 10)]);
        let mut reader = Reader::new(Cursor::new(data), true);
        assert_eq!(reader.read_record().unwrap().unwrap().name, b"c.b.a");
        assert_eq!(reader.read_record().unwrap().unwrap().name, b"a.b?x=y");
    }

    #[test]
    fn truncated_tail_is_sticky_eof() {
        let mut data = staged(&[("a.b.c", 1.0, 10), ("x.y", 2.0, 10)]);
        data.truncate(data.len() - 3);
        let mut reader = Reader::new(Cursor::new(data), false);
        assert!(reader.read_record().unwrap().is_some());
        assert!(matches!(
            reader.read_record(),
            Err(ReadError::RecordTruncated(_))
        ));
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn date_mismatch_stops_reading() {
        let mut wb = WriteBuffer::acquire();
        wb.write_graphite_point(b"bad", 1.0, 86400 * 3, 2, 0);
        wb.write_graphite_point(b"good", 1.0, 86400 * 3, 3, 0);
        let mut reader = Reader::new(Cursor::new(wb.as_bytes().to_vec()), false);
        assert!(matches!(
            reader.read_record(),
            Err(ReadError::DateMismatch { days: 2, .. })
        ));
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn read_impl_yields_only_good_records() {
        let good = staged(&[("a.b.c", 1.0, 10), ("x.y", 2.0, 10)]);
        let mut data = good.clone();
        data.extend_from_slice(&[0x05, b'z', b'z']);

        let mut out = vec![];
        let mut reader = Reader::new(Cursor::new(data), false);
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, good);
    }

    #[test]
    fn zero_version() {
        let data = staged(&[("a.b.c", 1.0, 10)]);
        let mut reader = Reader::new(Cursor::new(data), false).with_zero_version(true);
        let mut out = vec![];
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(&out[out.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn opens_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.1");
        std::fs::write(&path, staged(&[("m", 5.0, 100)])).unwrap();
        let mut reader = Reader::open(&path, false).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap().value, 5.0);
    }

    #[test]
    fn opens_lz4_files() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("default.1{LZ4_EXTENSION}"));
        let data = staged(&[("a.b.c", 1.0, 1559465760), ("x.y", 3.0, 1559465762)]);
        let mut encoder = lz4_flex::frame::FrameEncoder::new(std::fs::File::create(&path).unwrap());
        encoder.write_all(&data).unwrap();
        encoder.finish().unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), data);

        let mut reader = Reader::open(&path, true).unwrap();
        assert!(matches!(reader.inner, StageFile::Lz4(_)));
        assert_eq!(reader.read_record().unwrap().unwrap().name, b"c.b.a");
        assert_eq!(reader.read_record().unwrap().unwrap().name, b"y.x");
        assert!(reader.read_record().unwrap().is_none());

        let mut out = vec![];
        Reader::open(&path, false).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
