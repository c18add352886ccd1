//! The `index` table: per-day rows for every name and a date-less tree of
//! every name and ancestor, both also in reversed form.

use std::{
    io::{self, Write},
    path::Path,
};

use carbonhouse_rowbinary::{Reader, WRITE_BUFFER_SIZE, WriteBuffer, now_secs, reverse_bytes};
use hashbrown::HashSet;
use tracing::warn;

use crate::{
    cmap::CMap,
    config::KeyHash,
    handler::{Transform, Transformed, each_record},
    path_level,
};

/// Level offset of per-day rows with a reversed name.
pub const REVERSE_LEVEL_OFFSET: u32 = 10000;
/// Level offset of tree rows.
pub const TREE_LEVEL_OFFSET: u32 = 20000;
/// Level offset of tree rows with a reversed name.
pub const REVERSE_TREE_LEVEL_OFFSET: u32 = 30000;

#[derive(Debug)]
pub(crate) struct Index {
    tree_date: u16,
    hash: KeyHash,
    daily: bool,
}

impl Index {
    pub(crate) fn new(tree_date: u16, hash: KeyHash, disable_daily_index: bool) -> Self {
        Self {
            tree_date,
            hash,
            daily: !disable_daily_index,
        }
    }
}

fn write_row(wb: &mut WriteBuffer, date: u16, level: u32, path: &[u8], version: u32) {
    wb.write_u16(date);
    wb.write_u32(level);
    wb.write_bytes(path);
    wb.write_u32(version);
}

impl Transform for Index {
    fn transform(&self, path: &Path, cache: &CMap, out: &mut dyn Write) -> io::Result<Transformed> {
        let mut reader = Reader::open(path, false)?;
        let version = now_secs();

        let mut new_keys = HashSet::new();
        // ancestors already in this file's tree
        let mut new_uniq: HashSet<Vec<u8>> = HashSet::new();
        let mut wb = WriteBuffer::acquire();

        each_record(&mut reader, path, |record| {
            if record.is_tagged() {
                return Ok(());
            }
            let key = self.hash.key(record.days, record.name);
            if cache.contains(&key) || new_keys.contains(&key) {
                return Ok(());
            }

            let name = record.name;
            let level = path_level(name);
            let reversed = reverse_bytes(name);
            wb.reset();

            write_row(&mut wb, self.tree_date, level + TREE_LEVEL_OFFSET, name, version);
            let mut ancestors = vec![];
            let mut prefix = name;
            for l in (1..level).rev() {
                let Some(dot) = prefix.iter().rposition(|&b| b == b'.') else {
                    break;
                };
                let ancestor = &prefix[..=dot];
                if new_uniq.contains(ancestor) {
                    break;
                }
                write_row(&mut wb, self.tree_date, l + TREE_LEVEL_OFFSET, ancestor, version);
                ancestors.push(ancestor);
                prefix = &prefix[..dot];
            }
            write_row(
                &mut wb,
                self.tree_date,
                level + REVERSE_TREE_LEVEL_OFFSET,
                &reversed,
                version,
            );

            if self.daily {
                write_row(&mut wb, record.days, level, name, version);
                write_row(
                    &mut wb,
                    record.days,
                    level + REVERSE_LEVEL_OFFSET,
                    &reversed,
                    version,
                );
            }

            if wb.len() > WRITE_BUFFER_SIZE {
                warn!(
                    path = %path.display(),
                    metric = %String::from_utf8_lossy(name),
                    "index rows overflow the write buffer, skipping metric"
                );
                return Ok(());
            }

            out.write_all(wb.as_bytes())?;
            new_uniq.extend(ancestors.into_iter().map(<[u8]>::to_vec));
            new_keys.insert(key);
            Ok(())
        })?;

        Ok(Transformed {
            metrics: new_keys.len() as u64,
            new_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DEFAULT_TREE_DATE,
        test_util::{Rows, stage_file},
    };
    use pretty_assertions::assert_eq;

    fn rows(out: &[u8]) -> Vec<(u16, u32, String)> {
        Rows(out)
            .index_rows()
            .into_iter()
            .map(|(date, level, path, _)| (date, level, path))
            .collect()
    }

    fn row(date: u16, level: u32, path: &str) -> (u16, u32, String) {
        (date, level, path.to_string())
    }

    #[test]
    fn tree_rollup() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 86400 * 18049 + 3600;
        let path = stage_file(dir.path(), "default.1", &[("a.b.c.d", ts), ("a.b.c.e", ts)]);

        let mut out = vec![];
        let transformed = Index::new(DEFAULT_TREE_DATE, KeyHash::None, false)
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        assert_eq!(transformed.metrics, 2);
        assert_eq!(
            rows(&out),
            vec![
                row(42, 20004, "a.b.c.d"),
                row(42, 20003, "a.b.c."),
                row(42, 20002, "a.b."),
                row(42, 20001, "a."),
                row(42, 30004, "d.c.b.a"),
                row(18049, 4, "a.b.c.d"),
                row(18049, 10004, "d.c.b.a"),
                row(42, 20004, "a.b.c.e"),
                row(42, 30004, "e.c.b.a"),
                row(18049, 4, "a.b.c.e"),
                row(18049, 10004, "e.c.b.a"),
            ]
        );
    }

    #[test]
    fn without_daily_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(dir.path(), "default.1", &[("a.b", 86400), ("a.b", 86400 * 2)]);

        let mut out = vec![];
        Index::new(17106, KeyHash::None, true)
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        // the second day adds only its tree leaf, the ancestor is known
        assert_eq!(
            rows(&out),
            vec![
                row(17106, 20002, "a.b"),
                row(17106, 20001, "a."),
                row(17106, 30002, "b.a"),
                row(17106, 20002, "a.b"),
                row(17106, 30002, "b.a"),
            ]
        );
    }

    #[test]
    fn warm_cache_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(
            dir.path(),
            "default.1",
            &[("a.b.c", 86400), ("x.y", 86400), ("t?k=v", 86400)],
        );
        let index = Index::new(DEFAULT_TREE_DATE, KeyHash::Xxh64, false);
        let cache = CMap::new();

        let mut out = vec![];
        let transformed = index.transform(&path, &cache, &mut out).unwrap();
        assert!(!out.is_empty());
        assert_eq!(transformed.new_keys.len(), 2);
        cache.merge(transformed.new_keys, 1);

        let mut out = vec![];
        let transformed = index.transform(&path, &cache, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(transformed.new_keys.is_empty());
    }
}
