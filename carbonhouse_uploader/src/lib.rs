//! Uploads staged row-binary files into column-store tables.
//!
//! Every configured table owns a directory of references (`default.<nanos>`)
//! created by the stage writer. An [`Uploader`] scans that directory, turns
//! each referenced file into the rows its table expects and streams them to
//! the store with an `INSERT ... FORMAT RowBinary` request. A reference is
//! renamed to `_default.<nanos>` once the store accepted the file, and is
//! left alone otherwise so the next scan retries it.
//!
//! Table kinds:
//!
//! * `points`, `points-reverse`: the staged records themselves.
//! * `series`, `series-reverse`: one `(Date, Level, Path, Version)` row per
//!   name and day.
//! * `index`: the daily rows plus a date-less tree of every ancestor.
//! * `tagged`: one row per tag of every tagged name.
//!
//! All kinds but points remember uploaded keys in a [`CMap`] so a name is
//! only sent again after its entry expires.

use std::io;

use thiserror::Error;

mod base;
mod client;
pub mod cmap;
pub mod config;
pub mod filter;
mod handler;
mod index;
mod points;
mod series;
mod tagged;
#[cfg(test)]
mod test_util;
pub mod tls;

pub use base::{InProgress, Uploader};
pub use cmap::CMap;
pub use config::{Compression, Config, KeyHash, Kind};
pub use index::{REVERSE_LEVEL_OFFSET, REVERSE_TREE_LEVEL_OFFSET, TREE_LEVEL_OFFSET};
pub use tls::{CertificatePair, Tls};

/// Prefix of a reference that is waiting for upload.
pub const PENDING_PREFIX: &str = "default.";

/// Prefix a reference gets once its table holds the file.
pub const FINISHED_PREFIX: &str = "_default.";

/// Response body fragment the store sends when a request body ends inside a row.
const CORRUPT_INPUT_MESSAGE: &str = "Cannot read all data";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("at least one upload thread is required")]
    NoThreads,

    #[error("invalid date {date:?}, expected YYYY-MM-DD: {source}")]
    InvalidDate {
        date: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("date {date} is out of range")]
    DateOutOfRange { date: String },

    #[error("tls: {0}")]
    Tls(String),

    #[error("tls: unable to read {path}: {source}")]
    TlsFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("tls: invalid pem in {path}: {source}")]
    TlsPem {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("clickhouse response status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read stage file: {0}")]
    Read(#[source] io::Error),
}

impl Error {
    /// The store rejected the body because it ended mid-row, which a stage
    /// file cut short by a crash does.
    pub fn is_corrupt_input(&self) -> bool {
        matches!(self, Self::Status { body, .. } if body.contains(CORRUPT_INPUT_MESSAGE))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Segments in a dotted name.
pub(crate) fn path_level(name: &[u8]) -> u32 {
    name.iter().filter(|&&b| b == b'.').count() as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(path_level(b"a"), 1);
        assert_eq!(path_level(b"a.b.c.d"), 4);
        assert_eq!(path_level(b"a.b."), 3);
    }

    #[test]
    fn corrupt_input() {
        let err = Error::Status {
            status: 500,
            body: "Code: 33. DB::Exception: Cannot read all data. Bytes read: 3.".to_string(),
        };
        assert!(err.is_corrupt_input());

        let err = Error::Status {
            status: 500,
            body: "Code: 60. DB::Exception: Table default.graphite doesn't exist.".to_string(),
        };
        assert!(!err.is_corrupt_input());
    }
}
