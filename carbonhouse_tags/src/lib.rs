//! Canonical names for tagged series.
//!
//! Every tagged series is stored under a single name of the form
//! `path?k1=v1&k2=v2`, keys sorted and unique, each side URL encoded. This
//! crate turns graphite `name;k=v` names, template-matched plain names and
//! Prometheus label sets into that form.

use thiserror::Error;

pub mod escape;
pub mod graphite;
pub mod prometheus;
pub mod template;

pub use graphite::graphite;
pub use prometheus::prometheus;
pub use template::{TagConfig, TagRules};

/// Most tags a single graphite name may carry.
pub const MAX_TAGS: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("cannot parse path {path:?}, no metric found")]
    NoMetric { path: String },

    #[error("cannot parse path {path:?}, invalid segment {segment:?}")]
    InvalidSegment { path: String, segment: String },

    #[error("cannot parse path {path:?}, more than {MAX_TAGS} tags")]
    TooManyTags { path: String },

    #[error("wrong template format: {0:?}")]
    InvalidTemplate(String),

    #[error("invalid tag {0:?}, expected key=value")]
    InvalidTag(String),

    #[error("invalid template filter {filter:?}: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
