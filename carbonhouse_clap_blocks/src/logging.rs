//! Common CLI flags for logging.
//!
//! Every flag is optional so the `[logging]` section of the config file can
//! fill in whatever the command line leaves out.

use carbonhouse_logging::{Builder, LogDestination, LogFormat, Result};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, Default, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,hyper::proto::h1=info` specifies debug logging for all modules
    /// except for the `hyper::proto::h1' module which will only display info
    /// level logging.
    ///
    /// Overrides `level` of the `[logging]` section; overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper::proto::h1=info,h2=info'
    ///
    /// -vvv 'trace,hyper::proto::h1=info,h2=info'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Can be one of: stdout, stderr, or a file path to append to.
    ///
    /// Overrides `file` of the `[logging]` section.
    #[clap(long = "log-destination", env = "LOG_DESTINATION", action)]
    pub log_destination: Option<LogDestination>,

    /// Logs: message format
    ///
    /// Can be one of:
    ///
    /// full: human-readable, single line
    ///
    /// pretty: human-readable, multi line
    ///
    /// json: machine-parseable, one object per line
    #[clap(long = "log-format", env = "LOG_FORMAT", action)]
    pub log_format: Option<LogFormat>,
}

/// Logging settings from the config file, used where no flag is given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingDefaults {
    pub filter: String,
    pub destination: LogDestination,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn to_builder(&self, defaults: &LoggingDefaults) -> Result<Builder<BoxMakeWriter>> {
        let mut builder = Builder::new();
        if !defaults.filter.is_empty() {
            builder = builder.with_default_log_filter(&defaults.filter)?;
        }
        builder
            .with_log_filter(self.log_filter.as_deref())?
            // with_log_verbose_count goes after with_log_filter because -v
            // overrides --log-filter.
            .with_log_verbose_count(self.log_verbose_count)
            .with_log_format(self.log_format.unwrap_or(defaults.format))
            .with_log_destination(
                self.log_destination
                    .as_ref()
                    .unwrap_or(&defaults.destination),
            )
    }

    /// Build the subscriber and install it for the whole process.
    pub fn install_global_subscriber(&self, defaults: &LoggingDefaults) -> Result<()> {
        self.to_builder(defaults)?.install_global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn flags_default_to_none() {
        let config = LoggingConfig::parse_from(["carbonhouse"]);
        assert_eq!(config.log_filter, None);
        assert_eq!(config.log_verbose_count, 0);
        assert_eq!(config.log_destination, None);
        assert_eq!(config.log_format, None);
    }

    #[test]
    fn parse_flags() {
        let config = LoggingConfig::parse_from([
            "carbonhouse",
            "-vv",
            "--log-filter",
            "warn",
            "--log-destination",
            "/var/log/carbonhouse.log",
            "--log-format",
            "json",
        ]);
        assert_eq!(config.log_verbose_count, 2);
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
        assert_eq!(
            config.log_destination,
            Some(LogDestination::File(PathBuf::from("/var/log/carbonhouse.log")))
        );
        assert_eq!(config.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn invalid_default_filter() {
        let defaults = LoggingDefaults {
            filter: "[[[".to_string(),
            ..Default::default()
        };
        assert!(LoggingConfig::default().to_builder(&defaults).is_err());
        assert!(
            LoggingConfig::default()
                .to_builder(&LoggingDefaults::default())
                .is_ok()
        );
    }
}
