use std::path::{Path, PathBuf};

use carbonhouse_rowbinary::{WriteBuffer, timestamp_to_days, varint::decode_uvarint};

/// Write a stage file of `(name, timestamp)` records with value 1 and version 7.
pub(crate) fn stage_file(dir: &Path, file: &str, points: &[(&str, u32)]) -> PathBuf {
    let mut wb = WriteBuffer::acquire();
    for (name, timestamp) in points {
        wb.write_graphite_point(
            name.as_bytes(),
            1.0,
            *timestamp,
            timestamp_to_days(*timestamp),
            7,
        );
    }
    let path = dir.join(file);
    std::fs::write(&path, wb.as_bytes()).unwrap();
    path
}

/// Cursor over row-binary output.
#[derive(Debug)]
pub(crate) struct Rows<'a>(pub(crate) &'a [u8]);

impl Rows<'_> {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn u16(&mut self) -> u16 {
        let (v, rest) = self.0.split_at(2);
        self.0 = rest;
        u16::from_le_bytes(v.try_into().unwrap())
    }

    pub(crate) fn u32(&mut self) -> u32 {
        let (v, rest) = self.0.split_at(4);
        self.0 = rest;
        u32::from_le_bytes(v.try_into().unwrap())
    }

    pub(crate) fn uvarint(&mut self) -> u64 {
        let (v, n) = decode_uvarint(self.0).unwrap();
        self.0 = &self.0[n..];
        v
    }

    pub(crate) fn string(&mut self) -> String {
        let len = self.uvarint() as usize;
        let (v, rest) = self.0.split_at(len);
        self.0 = rest;
        String::from_utf8(v.to_vec()).unwrap()
    }

    /// `(Date, Level, Path, Version)` rows until the end.
    pub(crate) fn index_rows(mut self) -> Vec<(u16, u32, String, u32)> {
        let mut rows = vec![];
        while !self.is_empty() {
            rows.push((self.u16(), self.u32(), self.string(), self.u32()));
        }
        rows
    }
}
