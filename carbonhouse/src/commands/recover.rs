//! Copy the readable prefix of a damaged stage file.

use std::{
    io::{self, BufRead, Read, Write},
    path::Path,
};

use carbonhouse_rowbinary::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to copy records: {0}")]
    Copy(#[from] io::Error),
}

/// Write every valid record of `path` to stdout, in row-binary, stopping at
/// the first damaged one.
pub fn command(path: &Path) -> Result<(), Error> {
    let reader = Reader::open(path, false).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let copied = copy(reader, &mut out)?;
    out.flush()?;
    eprintln!("recovered {copied} bytes");
    Ok(())
}

fn copy<R: BufRead>(mut reader: Reader<R>, out: &mut impl Write) -> io::Result<u64> {
    io::copy(&mut reader as &mut dyn Read, out)
}
