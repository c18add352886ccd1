//! Log initialization and setup

pub mod config;

pub use config::*;

use std::{
    cmp::min,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, writer::BoxMakeWriter},
    layer::{Layered, SubscriberExt},
};

/// Maximum length of a log line.
/// Space for a final trailing newline if truncated.
///
/// Log collectors split lines at 16KiB, so lines are truncated right below
/// that and kept newline terminated.
const MAX_LINE_LENGTH: usize = 16 * 1024 - 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter {filter:?}: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot set global tracing subscriber")]
    SetGlobalDefaultError(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn parse_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter).map_err(|source| Error::InvalidFilter {
        filter: filter.to_string(),
        source,
    })
}

/// Builder for the log subscriber.
#[derive(Debug)]
pub struct Builder<W = fn() -> io::Stdout> {
    log_format: LogFormat,
    log_filter: Option<EnvFilter>,
    // used when log_filter is none.
    default_log_filter: EnvFilter,
    make_writer: W,
    with_target: bool,
    with_ansi: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_filter: None,
            default_log_filter: EnvFilter::new(Self::DEFAULT_LOG_FILTER),
            make_writer: io::stdout,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }
}

// This needs to be a separate impl block because they place different bounds on the type parameters.
impl<W> Builder<W> {
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    pub fn with_writer<W2>(self, make_writer: W2) -> Builder<W2>
    where
        W2: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Builder::<W2> {
            make_writer,
            // cannot use `..self` because W type parameter changes
            log_format: self.log_format,
            log_filter: self.log_filter,
            default_log_filter: self.default_log_filter,
            with_target: self.with_target,
            with_ansi: self.with_ansi,
        }
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some(EnvFilter::new("info")),
            2 => Some(EnvFilter::new("debug,hyper::proto::h1=info,h2=info")),
            _ => Some(EnvFilter::new("trace,hyper::proto::h1=info,h2=info")),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: Option<&str>) -> Result<Self> {
        let log_filter = log_filter.map(parse_filter).transpose()?;
        Ok(Self { log_filter, ..self })
    }

    pub fn with_default_log_filter(self, default_log_filter: impl AsRef<str>) -> Result<Self> {
        let default_log_filter = parse_filter(default_log_filter.as_ref())?;
        Ok(Self {
            default_log_filter,
            ..self
        })
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    /// Log lines are written with a single call to the destination, capped
    /// at [`MAX_LINE_LENGTH`].
    pub fn with_log_destination(
        self,
        log_destination: &LogDestination,
    ) -> Result<Builder<BoxMakeWriter>> {
        let (make_writer, with_ansi) = match log_destination {
            LogDestination::Stdout => (make_writer(io::stdout), self.with_ansi),
            LogDestination::Stderr => (make_writer(io::stderr), self.with_ansi),
            LogDestination::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| Error::OpenFile {
                        path: path.clone(),
                        source,
                    })?;
                let file = Arc::new(file);
                (make_writer(move || SharedFile(Arc::clone(&file))), false)
            }
        };
        Ok(Builder {
            make_writer,
            with_ansi,
            // cannot use `..self` because W type parameter changes
            log_format: self.log_format,
            log_filter: self.log_filter,
            default_log_filter: self.default_log_filter,
            with_target: self.with_target,
        })
    }

    /// Sets whether or not an event's target and location are displayed.
    pub fn with_target(self, with_target: bool) -> Self {
        Self {
            with_target,
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }
}

type FilteredRegistry = Layered<EnvFilter, Registry>;

impl<W> Builder<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    pub fn build(self) -> impl Subscriber + Send + Sync {
        let writer = self.make_writer;
        let layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match self.log_format {
            LogFormat::Full => fmt::layer()
                .with_writer(writer)
                .with_target(self.with_target)
                .with_ansi(self.with_ansi)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(self.with_target)
                .with_ansi(self.with_ansi)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(self.with_target)
                .with_ansi(false)
                .boxed(),
        };

        let log_filter = self.log_filter.unwrap_or(self.default_log_filter);
        Registry::default().with(log_filter).with(layer)
    }

    /// Build a subscriber and install it as the global default for all threads.
    pub fn install_global(self) -> Result<()> {
        tracing::subscriber::set_global_default(self.build())?;
        Ok(())
    }
}

fn make_writer<F, W>(f: F) -> BoxMakeWriter
where
    F: Fn() -> W + Send + Sync + 'static,
    W: Write + 'static,
{
    BoxMakeWriter::new(move || {
        io::LineWriter::with_capacity(MAX_LINE_LENGTH, LimitedWriter(MAX_LINE_LENGTH, f()))
    })
}

#[derive(Debug)]
struct SharedFile(Arc<File>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

#[derive(Debug)]
struct LimitedWriter<W: Write>(usize, W);

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let truncated = &buf[..min(self.0, buf.len())];
        let had_trailing_newline = buf[buf.len() - 1] == b'\n';
        if had_trailing_newline && (truncated[truncated.len() - 1] != b'\n') {
            // keep it one write, with the newline put back
            let mut tmp = truncated.to_vec();
            tmp.push(b'\n');
            self.1.write_all(&tmp).map(|_| buf.len())
        } else {
            self.1.write_all(truncated).map(|_| buf.len())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.1.flush()
    }
}
