//! Fan-out of finished stage files into the per-table directories.

use std::{
    io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use snafu::prelude::*;
use tracing::debug;

use crate::{
    CreateDirectorySnafu, CreateLinkSnafu, InvalidFileNameSnafu, ReadDirectorySnafu, Result,
    Writer, is_stage_file,
};

/// `<stage>/<table>/<file name>` with a leading `_`, the reference left behind
/// once `table` has uploaded the file.
pub fn finished_name(file_name: &str) -> String {
    format!("_{file_name}")
}

fn exists(path: &Path) -> bool {
    // the reference itself, whether or not its target is still there
    path.symlink_metadata().is_ok()
}

pub(crate) fn ensure_table_dir(dir: &Path) -> Result<()> {
    match std::fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(source).context(CreateDirectorySnafu { path: dir }),
    }
}

/// Create a relative reference to `stage_file` in every table directory.
///
/// A table that already has the pending or the finished reference is left
/// alone.
pub fn link(stage_file: &Path, tables: &[String]) -> Result<()> {
    let (Some(dir), Some(file_name)) = (
        stage_file.parent(),
        stage_file.file_name().and_then(|n| n.to_str()),
    ) else {
        return InvalidFileNameSnafu { path: stage_file }.fail();
    };

    for table in tables {
        let table_dir = dir.join(table);
        ensure_table_dir(&table_dir)?;

        let reference = table_dir.join(file_name);
        if exists(&reference) || exists(&table_dir.join(finished_name(file_name))) {
            continue;
        }

        let target: PathBuf = ["..", file_name].iter().collect();
        symlink(&target, &reference).context(CreateLinkSnafu { path: &reference })?;
        debug!(reference = %reference.display(), "linked");
    }
    Ok(())
}

impl Writer {
    /// Link every stage file found in the stage directory. Recovers files
    /// whose fan-out was interrupted by a crash.
    pub fn link_all(&self) -> Result<()> {
        let path = &self.config.path;
        let entries = std::fs::read_dir(path).context(ReadDirectorySnafu { path })?;

        for entry in entries {
            let entry = entry.context(ReadDirectorySnafu { path })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }
            if !entry.file_name().to_str().is_some_and(is_stage_file) {
                continue;
            }
            link(&entry.path(), &self.config.tables)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tables() -> Vec<String> {
        vec!["points".to_string(), "tree".to_string()]
    }

    #[test]
    fn relative_references() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("default.100");
        std::fs::write(&file, b"").unwrap();

        link(&file, &tables()).unwrap();
        for table in tables() {
            let reference = dir.path().join(&table).join("default.100");
            assert_eq!(
                std::fs::read_link(&reference).unwrap(),
                PathBuf::from("../default.100")
            );
            assert!(reference.metadata().is_ok());
        }

        // a second pass is a no-op
        link(&file, &tables()).unwrap();
    }

    #[test]
    fn finished_tables_are_not_relinked() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("default.100");
        std::fs::write(&file, b"").unwrap();
        std::fs::create_dir(dir.path().join("points")).unwrap();
        symlink("../default.100", dir.path().join("points/_default.100")).unwrap();

        link(&file, &tables()).unwrap();
        assert!(!exists(&dir.path().join("points/default.100")));
        assert!(exists(&dir.path().join("tree/default.100")));
    }
}
