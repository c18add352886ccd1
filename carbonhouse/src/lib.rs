//! Graphite and Prometheus ingestion agent for a column store.
//!
//! Samples arrive on the receivers, are encoded as row-binary and staged on
//! disk by the writer, and the uploaders push every staged file into each
//! configured table.

use std::sync::LazyLock;

pub mod app;
pub mod collector;
pub mod config;
pub mod debug;

pub mod commands {
    pub mod cat;
    pub mod recover;
}

/// The version string reported by `--version`, `version` and the startup
/// log line.
///
/// The commit is taken from the `GIT_HASH` variable at build time, when set.
pub static VERSION_STRING: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.trim().is_empty() => format!("{version}, revision {}", hash.trim()),
        _ => version.to_string(),
    }
});
