//! Removal of stage files every table has uploaded.

use std::{path::Path, sync::Arc, sync::atomic::Ordering, time::Duration};

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    ReadDirectorySnafu, RemoveFileSnafu, Result, Writer, is_stage_file,
    link::{ensure_table_dir, finished_name},
};

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Remove `stage_file` together with its finished references once every
/// table has finished it. Returns whether the file was removed.
///
/// With no tables configured nothing is ever finished.
pub fn cleanup_file(stage_file: &Path, tables: &[String]) -> Result<bool> {
    let (Some(dir), Some(file_name)) = (
        stage_file.parent(),
        stage_file.file_name().and_then(|n| n.to_str()),
    ) else {
        return Ok(false);
    };
    if tables.is_empty() {
        return Ok(false);
    }

    let finished = finished_name(file_name);
    let all_finished = tables
        .iter()
        .all(|table| dir.join(table).join(&finished).symlink_metadata().is_ok());
    if !all_finished {
        return Ok(false);
    }

    std::fs::remove_file(stage_file).context(RemoveFileSnafu { path: stage_file })?;
    for table in tables {
        let path = dir.join(table).join(&finished);
        std::fs::remove_file(&path).context(RemoveFileSnafu { path: &path })?;
    }
    Ok(true)
}

impl Writer {
    /// One cleanup pass over the stage directory.
    ///
    /// Creates missing table directories, removes stage files that every
    /// table has finished and drops references whose target is gone.
    pub fn cleanup(&self) -> Result<()> {
        let path = &self.config.path;
        let tables = &self.config.tables;

        for table in tables {
            ensure_table_dir(&path.join(table))?;
        }

        let mut unhandled = vec![];
        for entry in std::fs::read_dir(path).context(ReadDirectorySnafu { path })? {
            let entry = entry.context(ReadDirectorySnafu { path })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }
            if entry.file_name().to_str().is_some_and(is_stage_file) {
                unhandled.push(entry.path());
            }
        }

        let mut count = unhandled.len();
        let mut removed = Ok(());
        for file in &unhandled {
            match cleanup_file(file, tables) {
                Ok(true) => count -= 1,
                Ok(false) => {}
                Err(e) => {
                    removed = Err(e);
                    break;
                }
            }
        }
        self.unhandled.store(count as u64, Ordering::Relaxed);
        removed?;

        for table in tables {
            let table_dir = path.join(table);
            let entries = std::fs::read_dir(&table_dir).context(ReadDirectorySnafu {
                path: &table_dir,
            })?;
            for entry in entries {
                let entry = entry.context(ReadDirectorySnafu { path: &table_dir })?;
                let reference = entry.path();
                if reference.metadata().is_err() {
                    info!(reference = %reference.display(), "remove broken link");
                    std::fs::remove_file(&reference).context(RemoveFileSnafu {
                        path: &reference,
                    })?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn cleaner(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.chunk_interval.max(MIN_CLEANUP_INTERVAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let writer = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || writer.cleanup()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%e, "cleanup failed"),
                Err(e) => error!(%e, "cleanup task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn tables() -> Vec<String> {
        vec!["t1".to_string(), "t2".to_string()]
    }

    fn stage() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.1"), b"x").unwrap();
        for table in tables() {
            std::fs::create_dir(dir.path().join(&table)).unwrap();
        }
        dir
    }

    #[test]
    fn waits_for_every_table() {
        let dir = stage();
        let file = dir.path().join("default.1");
        symlink("../default.1", dir.path().join("t1/_default.1")).unwrap();
        symlink("../default.1", dir.path().join("t2/default.1")).unwrap();
        assert!(!cleanup_file(&file, &tables()).unwrap());
        assert!(file.exists());

        std::fs::rename(
            dir.path().join("t2/default.1"),
            dir.path().join("t2/_default.1"),
        )
        .unwrap();
        assert!(cleanup_file(&file, &tables()).unwrap());
        assert!(!file.exists());
        assert!(dir.path().join("t1/_default.1").symlink_metadata().is_err());
        assert!(dir.path().join("t2/_default.1").symlink_metadata().is_err());
    }

    #[test]
    fn no_tables_never_finish() {
        let dir = stage();
        assert!(!cleanup_file(&dir.path().join("default.1"), &[]).unwrap());
    }
}
