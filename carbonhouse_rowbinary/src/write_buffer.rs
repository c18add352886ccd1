//! Fixed-capacity, pooled output buffers.
//!
//! Parsers fill a [`WriteBuffer`] with complete records and hand it to the
//! stage writer over the write channel. Buffers go back to a process-wide
//! pool when dropped, so the backing allocation is reused and returned
//! exactly once.

use std::sync::LazyLock;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    RECORD_TAIL_SIZE,
    confirm::{ConfirmGroup, ConfirmToken},
    reverse::reverse_in_place,
    varint,
};

/// Capacity of a single write buffer. A record never spans two buffers.
pub const WRITE_BUFFER_SIZE: usize = 524288;

/// Upper bound on idle buffers kept for reuse.
const POOL_CAPACITY: usize = 256;

static POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(POOL_CAPACITY));

#[derive(Debug)]
struct BufferPool {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
}

impl BufferPool {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    fn get(&self) -> Vec<u8> {
        match self.rx.try_recv() {
            Ok(mut body) => {
                body.clear();
                body
            }
            Err(_) => Vec::with_capacity(WRITE_BUFFER_SIZE),
        }
    }

    fn put(&self, body: Vec<u8>) {
        if body.capacity() >= WRITE_BUFFER_SIZE {
            // a full pool simply lets the allocation go
            let _ = self.tx.try_send(body);
        }
    }
}

#[derive(Debug)]
pub struct WriteBuffer {
    body: Vec<u8>,
    confirm: Option<ConfirmToken>,
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::acquire()
    }
}

impl WriteBuffer {
    /// Take an empty buffer from the pool.
    pub fn acquire() -> Self {
        Self {
            body: POOL.get(),
            confirm: None,
        }
    }

    /// Take an empty buffer whose flush must be reported to `group`.
    pub fn acquire_with_confirm(group: &ConfirmGroup) -> Self {
        Self {
            body: POOL.get(),
            confirm: Some(group.token()),
        }
    }

    /// Return the buffer to the pool. Equivalent to dropping it.
    pub fn release(self) {}

    pub fn confirm_required(&self) -> bool {
        self.confirm.is_some()
    }

    /// Detach the confirmation token so it can outlive the buffer.
    pub fn take_confirm(&mut self) -> Option<ConfirmToken> {
        self.confirm.take()
    }

    pub fn reset(&mut self) {
        self.body.clear();
        self.confirm = None;
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn free_size(&self) -> usize {
        WRITE_BUFFER_SIZE.saturating_sub(self.body.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Whether a graphite record with a `name_len` byte name still fits.
    pub fn can_write_graphite_point(&self, name_len: usize) -> bool {
        // a name that fits in a buffer never needs more than 5 prefix bytes
        self.free_size() > name_len + 5 + RECORD_TAIL_SIZE
    }

    pub fn write_bytes(&mut self, p: &[u8]) {
        varint::put_uvarint(&mut self.body, p.len() as u64);
        self.body.extend_from_slice(p);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_uvarint(&mut self, v: u64) {
        varint::put_uvarint(&mut self.body, v);
    }

    /// Write `p` length-prefixed with its dot segments in reverse order.
    pub fn write_reverse_path(&mut self, p: &[u8]) {
        varint::put_uvarint(&mut self.body, p.len() as u64);
        let start = self.body.len();
        self.body.extend_from_slice(p);
        reverse_in_place(&mut self.body[start..]);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.body.extend_from_slice(&buf);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.body.extend_from_slice(&buf);
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.body.extend_from_slice(&buf);
    }

    /// Append raw bytes without a length prefix.
    pub fn write(&mut self, p: &[u8]) {
        self.body.extend_from_slice(p);
    }

    /// Append one staged record.
    pub fn write_graphite_point(
        &mut self,
        name: &[u8],
        value: f64,
        timestamp: u32,
        days: u16,
        version: u32,
    ) {
        self.write_bytes(name);
        self.write_f64(value);
        self.write_u32(timestamp);
        self.write_u16(days);
        self.write_u32(version);
    }

    /// Drop everything written after `len`, used to roll back a partial row.
    pub fn truncate(&mut self, len: usize) {
        self.body.truncate(len);
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        POOL.put(std::mem::take(&mut self.body));
    }
}
