//! The TOML config file.
//!
//! Every section and key is optional; [`Config::default`] is what an empty
//! file means. Keys are kebab-case and unknown keys are rejected.

use std::{
    collections::BTreeMap,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use carbonhouse_logging::{LogDestination, LogFormat};
use carbonhouse_receiver::{Options, Protocol};
use carbonhouse_tags::TagConfig;
use carbonhouse_writer::{AutoInterval, Compression};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// `metric-endpoint` value that feeds self-metrics back into the stage.
pub const METRIC_ENDPOINT_LOCAL: &str = "local";

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/carbonhouse/carbonhouse.toml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unable to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("common.metric-endpoint {endpoint:?}: {reason}")]
    MetricEndpoint { endpoint: String, reason: String },

    #[error("{section}.listen {listen:?}: {reason}")]
    Listen {
        section: &'static str,
        listen: String,
        reason: String,
    },

    #[error("upload.{name}: {source}")]
    Upload {
        name: String,
        #[source]
        source: carbonhouse_uploader::Error,
    },

    #[error("convert-to-tagged: {0}")]
    Tags(#[from] carbonhouse_tags::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where self-metrics are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEndpoint {
    /// Straight into the write channel.
    Local,
    /// Plain text carbon protocol over TCP, `host:port`.
    Tcp(String),
    /// Plain text carbon protocol over UDP, `host:port`.
    Udp(String),
}

impl std::str::FromStr for MetricEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == METRIC_ENDPOINT_LOCAL {
            return Ok(Self::Local);
        }
        let url = Url::parse(s).map_err(|e| e.to_string())?;
        let host = url
            .host_str()
            .ok_or_else(|| "missing host".to_string())?;
        let port = url.port().ok_or_else(|| "missing port".to_string())?;
        let addr = format!("{host}:{port}");
        match url.scheme() {
            "tcp" => Ok(Self::Tcp(addr)),
            "udp" => Ok(Self::Udp(addr)),
            scheme => Err(format!(
                "only tcp and udp are supported, {scheme:?} is not"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Common {
    /// Prefix of self-metrics, `{host}` is replaced with the hostname.
    pub metric_prefix: String,
    #[serde(with = "humantime_serde")]
    pub metric_interval: Duration,
    /// `local`, `tcp://host:port` or `udp://host:port`.
    pub metric_endpoint: String,
    /// Runtime worker threads when `--num-threads` is not given; 0 uses
    /// every core.
    pub max_cpu: usize,
}

impl Default for Common {
    fn default() -> Self {
        Self {
            metric_prefix: "carbon.agents.{host}".to_string(),
            metric_interval: Duration::from_secs(60),
            metric_endpoint: METRIC_ENDPOINT_LOCAL.to_string(),
            max_cpu: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Data {
    /// Stage directory.
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub chunk_interval: Duration,
    /// `"<unhandled files>:<interval>,..."`, e.g. `"5:10s,20:60s"`, to
    /// rotate less often while uploads fall behind.
    pub chunk_auto_interval: AutoInterval,
    /// Rotate early once the open file reaches this many bytes; 0 disables.
    pub chunk_max_size: u64,
    /// `none` or `lz4`.
    pub compression: Compression,
    pub compression_level: u32,
}

impl Default for Data {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/data/carbonhouse/"),
            chunk_interval: Duration::from_secs(1),
            chunk_auto_interval: AutoInterval::default(),
            chunk_max_size: 0,
            compression: Compression::None,
            compression_level: 0,
        }
    }
}

/// Receiver section with the keys every protocol has plus `$field`s that
/// map onto the [`Options`] field of the same name.
macro_rules! receiver_config {
    (
        $(#[$meta:meta])*
        $name:ident {
            section = $section:literal,
            protocol = $protocol:expr,
            listen = $listen:literal,
            enabled = $enabled:literal,
            $(
                $(#[$field_meta:meta])*
                $field:ident : $ty:ty = $default:expr,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
        #[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
        pub struct $name {
            pub listen: String,
            pub enabled: bool,
            /// Samples further in the future are dropped; zero disables.
            #[serde(with = "humantime_serde")]
            pub drop_future: Duration,
            /// Samples further in the past are dropped; zero disables.
            #[serde(with = "humantime_serde")]
            pub drop_past: Duration,
            /// Names longer than this are dropped; zero disables.
            pub drop_longer_than: usize,
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    listen: $listen.to_string(),
                    enabled: $enabled,
                    drop_future: Duration::ZERO,
                    drop_past: Duration::ZERO,
                    drop_longer_than: 0,
                    $( $field: $default, )*
                }
            }
        }

        impl ReceiverConfig for $name {
            fn section(&self) -> &'static str {
                $section
            }

            fn protocol(&self) -> Protocol {
                $protocol
            }

            fn enabled(&self) -> bool {
                self.enabled
            }

            fn listen(&self) -> &str {
                &self.listen
            }

            fn options(&self, defaults: &Options) -> Options {
                #[allow(unused_mut)]
                let mut options = Options {
                    drop_future: self.drop_future,
                    drop_past: self.drop_past,
                    drop_longer_than: self.drop_longer_than,
                    ..defaults.clone()
                };
                $( options.$field = ToOwned::to_owned(&self.$field); )*
                options
            }
        }
    };
}

/// Common view of the receiver sections.
pub trait ReceiverConfig: std::fmt::Debug + Send + Sync {
    /// Name of the config section.
    fn section(&self) -> &'static str;
    fn protocol(&self) -> Protocol;
    fn enabled(&self) -> bool;
    fn listen(&self) -> &str;
    /// Receiver options from this section, everything else from `defaults`.
    fn options(&self, defaults: &Options) -> Options;

    fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen(self.listen()).map_err(|reason| Error::Listen {
            section: self.section(),
            listen: self.listen().to_string(),
            reason,
        })
    }
}

receiver_config! {
    /// `[udp]`
    Udp {
        section = "udp",
        protocol = Protocol::Udp,
        listen = ":2003",
        enabled = true,
        /// Log datagrams whose last line is incomplete.
        log_incomplete: bool = false,
    }
}

receiver_config! {
    /// `[tcp]`
    Tcp {
        section = "tcp",
        protocol = Protocol::Tcp,
        listen = ":2003",
        enabled = true,
        /// Connections idle for longer are closed.
        #[serde(with = "humantime_serde")]
        read_timeout: Duration = Duration::from_secs(120),
    }
}

receiver_config! {
    /// `[pickle]`
    Pickle {
        section = "pickle",
        protocol = Protocol::Pickle,
        listen = ":2004",
        enabled = true,
    }
}

receiver_config! {
    /// `[grpc]`
    Grpc {
        section = "grpc",
        protocol = Protocol::Grpc,
        listen = ":2005",
        enabled = false,
    }
}

receiver_config! {
    /// `[prometheus]`
    Prometheus {
        section = "prometheus",
        protocol = Protocol::Prometheus,
        listen = ":2006",
        enabled = false,
        /// Largest accepted request body in bytes.
        max_message_size: usize = 67_108_864,
    }
}

receiver_config! {
    /// `[telegraf-http-json]`
    TelegrafHttpJson {
        section = "telegraf-http-json",
        protocol = Protocol::TelegrafHttpJson,
        listen = ":2007",
        enabled = false,
        /// Joins metric and field names.
        concat: String = ".".to_string(),
        /// Largest accepted request body in bytes.
        max_message_size: usize = 67_108_864,
    }
}

/// `[debug]`: health and introspection HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DebugServer {
    pub listen: String,
    pub enabled: bool,
}

impl Default for DebugServer {
    fn default() -> Self {
        Self {
            listen: "localhost:7007".to_string(),
            enabled: false,
        }
    }
}

impl DebugServer {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen(&self.listen).map_err(|reason| Error::Listen {
            section: "debug",
            listen: self.listen.clone(),
            reason,
        })
    }
}

/// `[logging]`; the command line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Logging {
    /// `stdout`, `stderr` or a file to append to.
    pub file: LogDestination,
    /// Filter directive, e.g. `info` or `debug,hyper=info`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            file: LogDestination::Stdout,
            level: "info".to_string(),
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub common: Common,
    pub data: Data,
    pub udp: Udp,
    pub tcp: Tcp,
    pub pickle: Pickle,
    pub grpc: Grpc,
    pub prometheus: Prometheus,
    pub telegraf_http_json: TelegrafHttpJson,
    pub debug: DebugServer,
    pub logging: Logging,
    pub convert_to_tagged: TagConfig,
    /// Upload tables by section name.
    pub upload: BTreeMap<String, carbonhouse_uploader::Config>,
}

impl Config {
    /// Read and validate `path`; `None` means the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::parse(&text).map_err(|source| Error::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.common.metric_prefix = expand_host(&config.common.metric_prefix, &hostname());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check everything serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.metric_endpoint()?;
        for receiver in self.receivers() {
            if receiver.enabled() {
                receiver.listen_addr()?;
            }
        }
        if self.debug.enabled {
            self.debug.listen_addr()?;
        }
        for (name, upload) in &self.upload {
            upload.validate().map_err(|source| Error::Upload {
                name: name.clone(),
                source,
            })?;
        }
        self.convert_to_tagged.compile()?;
        Ok(())
    }

    pub fn metric_endpoint(&self) -> Result<MetricEndpoint> {
        self.common
            .metric_endpoint
            .parse()
            .map_err(|reason| Error::MetricEndpoint {
                endpoint: self.common.metric_endpoint.clone(),
                reason,
            })
    }

    /// Every receiver section, enabled or not.
    pub fn receivers(&self) -> [&dyn ReceiverConfig; 6] {
        [
            &self.tcp,
            &self.udp,
            &self.pickle,
            &self.grpc,
            &self.prometheus,
            &self.telegraf_http_json,
        ]
    }

    /// Names of the upload sections, which are also the names of the
    /// per-table stage subdirectories.
    pub fn tables(&self) -> Vec<String> {
        self.upload.keys().cloned().collect()
    }

    /// What `print-default-config` shows: the defaults plus a points and a
    /// tree table.
    pub fn example() -> Self {
        let mut config = Self::default();
        config.upload.insert(
            "graphite".to_string(),
            carbonhouse_uploader::Config {
                table: "graphite".to_string(),
                ..Default::default()
            },
        );
        config.upload.insert(
            "graphite_tree".to_string(),
            carbonhouse_uploader::Config {
                kind: carbonhouse_uploader::Kind::Index,
                table: "graphite_tree".to_string(),
                ..Default::default()
            },
        );
        config
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

/// `:2003` listens on every interface.
fn parse_listen(listen: &str) -> Result<SocketAddr, String> {
    let listen = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    match listen.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| format!("found no addresses for {listen:?}")),
        Err(e) => Err(format!("cannot parse socket address {listen:?}: {e}")),
    }
}

fn expand_host(prefix: &str, hostname: &str) -> String {
    prefix.replace("{host}", &hostname.replace('.', "_"))
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer outlives the call and its length is passed along.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
