//! Dump a stage file as tab separated text.

use std::{
    io::{self, BufRead, Write},
    path::Path,
};

use carbonhouse_rowbinary::{ReadError, Reader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to write output: {0}")]
    Write(#[from] io::Error),

    #[error("stage file is damaged after {records} records: {source}")]
    Read {
        records: u64,
        #[source]
        source: ReadError,
    },
}

/// Print every record of `path` to stdout, one
/// `name\tvalue\ttimestamp\tdate\tversion` line each.
pub fn command(path: &Path) -> Result<(), Error> {
    let reader = Reader::open(path, false).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    dump(reader, &mut out)?;
    out.flush()?;
    Ok(())
}

fn dump<R: BufRead>(mut reader: Reader<R>, out: &mut impl Write) -> Result<u64, Error> {
    let mut records = 0;
    loop {
        match reader.read_record() {
            Ok(Some(r)) => {
                writeln!(
                    out,
                    "{}\t{:?}\t{}\t{}\t{}",
                    String::from_utf8_lossy(r.name),
                    r.value,
                    r.timestamp,
                    r.days_string(),
                    r.version,
                )?;
                records += 1;
            }
            Ok(None) => return Ok(records),
            Err(source) => return Err(Error::Read { records, source }),
        }
    }
}
