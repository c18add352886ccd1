//! Producer side of the write channel.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    WRITE_BUFFER_SIZE,
    confirm::ConfirmGroup,
    days::DaysCache,
    now_secs,
    write_buffer::WriteBuffer,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("request cancelled")]
    Cancelled,

    #[error("writer is shutting down")]
    Stopped,

    #[error("write channel closed")]
    Closed,
}

/// Sending half of the single write channel plus the process-wide stop token.
///
/// Every send races the channel against the caller's cancellation and the
/// global stop; a buffer that loses the race is dropped, which returns it to
/// the pool.
#[derive(Debug, Clone)]
pub struct WriteSink {
    tx: mpsc::Sender<WriteBuffer>,
    stop: CancellationToken,
}

impl WriteSink {
    pub fn new(tx: mpsc::Sender<WriteBuffer>, stop: CancellationToken) -> Self {
        Self { tx, stop }
    }

    pub async fn send(&self, wb: WriteBuffer, cancel: &CancellationToken) -> Result<(), SendError> {
        tokio::select! {
            res = self.tx.send(wb) => res.map_err(|_| SendError::Closed),
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            _ = self.stop.cancelled() => Err(SendError::Stopped),
        }
    }

    /// Send unless `wb` holds nothing, in which case it is simply released.
    pub async fn send_non_empty(
        &self,
        wb: WriteBuffer,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        if wb.is_empty() {
            return Ok(());
        }
        self.send(wb, cancel).await
    }
}

/// Packs points for one request into as many buffers as needed.
///
/// All points share the request's `now` as their version.
#[derive(Debug)]
pub struct PointWriter<'a> {
    sink: &'a WriteSink,
    cancel: CancellationToken,
    confirm: Option<&'a ConfirmGroup>,
    wb: Option<WriteBuffer>,
    days: DaysCache,
    now: u32,
    points_written: u32,
    write_errors: u32,
}

impl<'a> PointWriter<'a> {
    pub fn new(sink: &'a WriteSink, cancel: CancellationToken) -> Self {
        Self::with_now(sink, cancel, now_secs())
    }

    pub fn with_now(sink: &'a WriteSink, cancel: CancellationToken, now: u32) -> Self {
        Self {
            sink,
            cancel,
            confirm: None,
            wb: None,
            days: DaysCache::new(),
            now,
            points_written: 0,
            write_errors: 0,
        }
    }

    /// Every buffer produced from here on carries a token from `group`.
    pub fn with_confirm(self, group: &'a ConfirmGroup) -> Self {
        Self {
            confirm: Some(group),
            ..self
        }
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    pub fn points_written(&self) -> u32 {
        self.points_written
    }

    pub fn write_errors(&self) -> u32 {
        self.write_errors
    }

    /// Append one point, sending the current buffer first when it is full.
    ///
    /// A name that can never fit a buffer is counted in `write_errors`.
    pub async fn write_point(
        &mut self,
        name: &[u8],
        value: f64,
        timestamp: u32,
    ) -> Result<(), SendError> {
        let fits = self
            .wb
            .as_ref()
            .is_some_and(|wb| wb.can_write_graphite_point(name.len()));
        if !fits {
            self.flush().await?;
            if name.len() > WRITE_BUFFER_SIZE - 50 {
                self.write_errors += 1;
                return Ok(());
            }
        }

        let days = self.days.timestamp_with_now(timestamp, self.now);
        let confirm = self.confirm;
        let wb = self.wb.get_or_insert_with(|| match confirm {
            Some(group) => WriteBuffer::acquire_with_confirm(group),
            None => WriteBuffer::acquire(),
        });
        wb.write_graphite_point(name, value, timestamp, days, self.now);
        self.points_written += 1;
        Ok(())
    }

    /// Hand the current buffer to the writer. Empty buffers are released.
    pub async fn flush(&mut self) -> Result<(), SendError> {
        match self.wb.take() {
            Some(wb) => self.sink.send_non_empty(wb, &self.cancel).await,
            None => Ok(()),
        }
    }
}
