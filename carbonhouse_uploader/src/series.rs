use std::{
    io::{self, Write},
    path::Path,
};

use carbonhouse_rowbinary::{Reader, WriteBuffer, now_secs};
use hashbrown::HashSet;

use crate::{
    cmap::CMap,
    config::KeyHash,
    handler::{Transform, Transformed, each_record},
    index::REVERSE_LEVEL_OFFSET,
    path_level,
};

/// One `(Date, Level, Path, Version)` row per untagged name and day.
#[derive(Debug)]
pub(crate) struct Series {
    reverse: bool,
    hash: KeyHash,
}

impl Series {
    pub(crate) fn new(reverse: bool, hash: KeyHash) -> Self {
        Self { reverse, hash }
    }
}

impl Transform for Series {
    fn transform(&self, path: &Path, cache: &CMap, out: &mut dyn Write) -> io::Result<Transformed> {
        let mut reader = Reader::open(path, self.reverse)?;
        let version = now_secs();
        let level_offset = if self.reverse { REVERSE_LEVEL_OFFSET } else { 0 };

        let mut new_keys = HashSet::new();
        let mut wb = WriteBuffer::acquire();
        each_record(&mut reader, path, |record| {
            if record.is_tagged() {
                return Ok(());
            }
            let key = self.hash.key(record.days, record.name);
            if cache.contains(&key) || new_keys.contains(&key) {
                return Ok(());
            }

            wb.reset();
            wb.write_u16(record.days);
            wb.write_u32(path_level(record.name) + level_offset);
            wb.write_bytes(record.name);
            wb.write_u32(version);
            out.write_all(wb.as_bytes())?;

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
    use crate::test_util::{Rows, stage_file};
    use pretty_assertions::assert_eq;

    #[test]
    fn rows_per_name_and_day() {
        let dir = tempfile::tempdir().unwrap();
        let day = 86400 * 18049;
        let path = stage_file(
            dir.path(),
            "default.1",
            &[
                ("a.b.c", day),
                ("a.b.c", day + 10),
                ("a.b.c", day + 86400),
                ("x?t=v", day),
                ("x", day),
            ],
        );

        let cache = CMap::new();
        let mut out = vec![];
        let transformed = Series::new(false, KeyHash::None)
            .transform(&path, &cache, &mut out)
            .unwrap();
        assert_eq!(transformed.metrics, 3);

        let rows: Vec<_> = Rows(&out)
            .index_rows()
            .into_iter()
            .map(|(date, level, path, _)| (date, level, path))
            .collect();
        assert_eq!(
            rows,
            vec![
                (18049, 3, "a.b.c".to_string()),
                (18050, 3, "a.b.c".to_string()),
                (18049, 1, "x".to_string()),
            ]
        );

        cache.merge(transformed.new_keys, 0);
        let mut again = vec![];
        let transformed = Series::new(false, KeyHash::None)
            .transform(&path, &cache, &mut again)
            .unwrap();
        assert_eq!(transformed.metrics, 0);
        assert!(again.is_empty());
    }

    #[test]
    fn reverse_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(dir.path(), "default.1", &[("a.b.c", 86400)]);

        let mut out = vec![];
        Series::new(true, KeyHash::Xxh64)
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        let rows = Rows(&out).index_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].1, 10003);
        assert_eq!(rows[0].2, "c.b.a");
    }
}
