use std::{
    borrow::Cow,
    io::{self, Write},
    iter,
    path::Path,
};

use carbonhouse_rowbinary::{
    Reader, WriteBuffer, now_secs,
    varint::{put_uvarint, uvarint_len},
};
use carbonhouse_tags::escape::unescape;
use hashbrown::HashSet;
use thiserror::Error;
use tracing::warn;

use crate::{
    cmap::CMap,
    config::KeyHash,
    handler::{Transform, Transformed, each_record},
};

const NAME_TAG_PREFIX: &str = "__name__=";

#[derive(Debug, Error)]
enum RowError {
    #[error("incomplete tags")]
    Incomplete,

    #[error("rows overflow the write buffer")]
    Overflow,
}

/// One `(Date, Tag1, Path, Tags, Version)` row per tag of every tagged name.
#[derive(Debug)]
pub(crate) struct Tagged {
    hash: KeyHash,
    /// Names uploaded with their `__name__` row only.
    ignored: HashSet<String>,
}

impl Tagged {
    pub(crate) fn new(hash: KeyHash, ignored: &[String]) -> Self {
        Self {
            hash,
            ignored: ignored.iter().cloned().collect(),
        }
    }

    fn write_rows(
        &self,
        name: &str,
        days: u16,
        version: u32,
        wb: &mut WriteBuffer,
    ) -> Result<(), RowError> {
        let (path, tags) = parse_tagged(name).ok_or(RowError::Incomplete)?;
        let name_tag = format!("{NAME_TAG_PREFIX}{path}");

        let mut all_tags = vec![];
        for tag in iter::once(name_tag.as_str()).chain(tags.iter().map(AsRef::as_ref)) {
            put_uvarint(&mut all_tags, tag.len() as u64);
            all_tags.extend_from_slice(tag.as_bytes());
        }
        let tag_count = (tags.len() + 1) as u64;

        let name_only = self.ignored.contains(path.as_ref()) || self.ignored.contains("*");
        let tag1: Vec<&str> = if name_only {
            vec![name_tag.as_str()]
        } else {
            iter::once(name_tag.as_str())
                .chain(tags.iter().map(AsRef::as_ref))
                .collect()
        };

        let row_tail = uvarint_len(name.len() as u64)
            + name.len()
            + uvarint_len(tag_count)
            + all_tags.len()
            + 4;
        let size: usize = tag1
            .iter()
            .map(|t| 2 + uvarint_len(t.len() as u64) + t.len() + row_tail)
            .sum();

        wb.reset();
        if size > wb.free_size() {
            return Err(RowError::Overflow);
        }
        for t in tag1 {
            wb.write_u16(days);
            wb.write_string(t);
            wb.write_string(name);
            wb.write_uvarint(tag_count);
            wb.write(&all_tags);
            wb.write_u32(version);
        }
        Ok(())
    }
}

/// Split `path?k1=v1&k2=v2` into the unescaped path and the unescaped
/// `k=v` pairs. A pair without `=` ends the list.
fn parse_tagged(name: &str) -> Option<(Cow<'_, str>, Vec<Cow<'_, str>>)> {
    let delim = name.find('?').filter(|&d| d > 0)?;
    let path = unescape(&name[..delim]);

    let mut tags = vec![];
    let mut args = &name[delim + 1..];
    while let Some(eq) = args.find('=') {
        match args[eq + 1..].find('&') {
            Some(amp) => {
                let end = eq + 1 + amp;
                tags.push(unescape(&args[..end]));
                args = &args[end + 1..];
            }
            None => {
                tags.push(unescape(args));
                break;
            }
        }
    }
    Some((path, tags))
}

impl Transform for Tagged {
    fn transform(&self, path: &Path, cache: &CMap, out: &mut dyn Write) -> io::Result<Transformed> {
        let mut reader = Reader::open(path, false)?;
        let version = now_secs();

        let mut new_keys = HashSet::new();
        let mut wb = WriteBuffer::acquire();
        each_record(&mut reader, path, |record| {
            if !record.is_tagged() {
                return Ok(());
            }
            let key = self.hash.key(record.days, record.name);
            if cache.contains(&key) || new_keys.contains(&key) {
                return Ok(());
            }

            let name = String::from_utf8_lossy(record.name);
            match self.write_rows(&name, record.days, version, &mut wb) {
                Ok(()) => {
                    out.write_all(wb.as_bytes())?;
                    new_keys.insert(key);
                }
                Err(error) => {
                    warn!(path = %path.display(), metric = %name, %error, "skipping tagged metric");
                }
            }
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
    fn parse() {
        let (path, tags) = parse_tagged("cpu.load?dc=eu+west&host=a%26b&rack=1").unwrap();
        assert_eq!(path, "cpu.load");
        assert_eq!(tags, vec!["dc=eu west", "host=a&b", "rack=1"]);

        let (path, tags) = parse_tagged("some%2Emetric?k=v&broken&x=y").unwrap();
        assert_eq!(path, "some.metric");
        assert_eq!(tags, vec!["k=v", "broken&x=y"]);

        let (_, tags) = parse_tagged("m?novalue").unwrap();
        assert!(tags.is_empty());

        assert!(parse_tagged("?a=b").is_none());
        assert!(parse_tagged("plain.name").is_none());
    }

    /// `(date, tag1, path, tags, version)`
    type Row = (u16, String, String, Vec<String>, u32);

    fn tagged_rows(out: &[u8]) -> Vec<Row> {
        let mut rows = Rows(out);
        let mut result = vec![];
        while !rows.is_empty() {
            let date = rows.u16();
            let tag1 = rows.string();
            let path = rows.string();
            let count = rows.uvarint();
            let tags = (0..count).map(|_| rows.string()).collect();
            result.push((date, tag1, path, tags, rows.u32()));
        }
        result
    }

    #[test]
    fn row_per_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(
            dir.path(),
            "default.1",
            &[
                ("cpu?dc=eu&host=a", 86400),
                ("cpu?dc=eu&host=a", 86400 + 60),
                ("plain.name", 86400),
            ],
        );

        let mut out = vec![];
        let transformed = Tagged::new(KeyHash::None, &[])
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        assert_eq!(transformed.metrics, 1);
        assert!(transformed.new_keys.contains("1:cpu?dc=eu&host=a"));

        let rows = tagged_rows(&out);
        let tags = vec![
            "__name__=cpu".to_string(),
            "dc=eu".to_string(),
            "host=a".to_string(),
        ];
        let tag1: Vec<&str> = rows.iter().map(|r| r.1.as_str()).collect();
        assert_eq!(tag1, vec!["__name__=cpu", "dc=eu", "host=a"]);
        for (date, _, path, row_tags, _) in &rows {
            assert_eq!(*date, 1);
            assert_eq!(path, "cpu?dc=eu&host=a");
            assert_eq!(row_tags, &tags);
        }
    }

    #[test]
    fn ignored_metrics_keep_name_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(
            dir.path(),
            "default.1",
            &[("cpu?host=a", 86400), ("mem?host=a", 86400)],
        );

        let mut out = vec![];
        Tagged::new(KeyHash::None, &["cpu".to_string()])
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        let tag1: Vec<String> = tagged_rows(&out).into_iter().map(|r| r.1).collect();
        assert_eq!(tag1, vec!["__name__=cpu", "__name__=mem", "host=a"]);

        let mut out = vec![];
        Tagged::new(KeyHash::None, &["*".to_string()])
            .transform(&path, &CMap::new(), &mut out)
            .unwrap();
        let rows = tagged_rows(&out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].3.len(), 2);
    }

    #[test]
    fn warm_cache_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_file(dir.path(), "default.1", &[("cpu?host=a", 86400)]);
        let tagged = Tagged::new(KeyHash::Xxh64, &[]);
        let cache = CMap::new();

        let mut out = vec![];
        let transformed = tagged.transform(&path, &cache, &mut out).unwrap();
        cache.merge(transformed.new_keys, 1);

        let mut out = vec![];
        tagged.transform(&path, &cache, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
