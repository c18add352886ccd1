//! Row-binary encoding shared by the receivers, the stage writer and the uploaders.
//!
//! A staged record is laid out as
//!
//! ```text
//! uvarint(len(name)) | name | f64 value | u32 timestamp | u16 days | u32 version
//! ```
//!
//! with every fixed-width field little-endian. The same layout is what the
//! points table expects in column order `(Path, Value, Time, Date, Timestamp)`,
//! so staged files can be streamed to the store without re-encoding.

pub mod confirm;
pub mod days;
pub mod reader;
pub mod reverse;
pub mod varint;
pub mod write_buffer;
pub mod writer;

pub use confirm::{ConfirmError, ConfirmGroup, ConfirmToken};
pub use days::{DaysCache, date_string, timestamp_to_days};
pub use reader::{ReadError, Reader, Record, StageFile};
pub use reverse::{reverse_bytes, reverse_in_place};
pub use write_buffer::{WRITE_BUFFER_SIZE, WriteBuffer};
pub use writer::{PointWriter, SendError, WriteSink};

/// Suffix of stage files written as an LZ4 frame.
pub const LZ4_EXTENSION: &str = ".lz4";

/// Bytes following the name of a staged record: value, timestamp, days and version.
pub const RECORD_TAIL_SIZE: usize = 8 + 4 + 2 + 4;

/// Current wall-clock second, saturated into the `u32` range used on disk.
pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or_default()
}
