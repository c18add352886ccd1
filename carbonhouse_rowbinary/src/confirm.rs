//! Synchronous write confirmation.
//!
//! A caller that needs to know its samples reached the stage file creates a
//! [`ConfirmGroup`], attaches a [`ConfirmToken`] to every buffer it produces
//! and then waits on the group. The writer resolves each token once the
//! buffer has been flushed.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("write failed: {0}")]
    Write(String),

    #[error("write aborted before the data reached disk")]
    Aborted,
}

/// Collects the outcome of every token issued from it.
#[derive(Debug)]
pub struct ConfirmGroup {
    tx: mpsc::UnboundedSender<Result<(), ConfirmError>>,
    rx: mpsc::UnboundedReceiver<Result<(), ConfirmError>>,
}

impl Default for ConfirmGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmGroup {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn token(&self) -> ConfirmToken {
        ConfirmToken {
            tx: Some(self.tx.clone()),
        }
    }

    /// Wait for every issued token to resolve and return the first error seen.
    pub async fn wait(self) -> Result<(), ConfirmError> {
        let Self { tx, mut rx } = self;
        drop(tx);

        let mut first_error = None;
        while let Some(result) = rx.recv().await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// One outstanding confirmation. Dropping an unresolved token reports
/// [`ConfirmError::Aborted`].
#[derive(Debug)]
pub struct ConfirmToken {
    tx: Option<mpsc::UnboundedSender<Result<(), ConfirmError>>>,
}

impl ConfirmToken {
    pub fn confirm(mut self) {
        self.resolve(Ok(()));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.resolve(Err(ConfirmError::Write(message.into())));
    }

    fn resolve(&mut self, result: Result<(), ConfirmError>) {
        if let Some(tx) = self.tx.take() {
            // the waiter may have given up; nothing to report to
            let _ = tx.send(result);
        }
    }
}

impl Drop for ConfirmToken {
    fn drop(&mut self) {
        self.resolve(Err(ConfirmError::Aborted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_confirmed() {
        let group = ConfirmGroup::new();
        let a = group.token();
        let b = group.token();
        tokio::spawn(async move {
            a.confirm();
            b.confirm();
        });
        assert_eq!(group.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn first_error_wins() {
        let group = ConfirmGroup::new();
        let a = group.token();
        let b = group.token();
        let c = group.token();
        a.fail("disk full");
        b.fail("second");
        c.confirm();
        assert_eq!(
            group.wait().await,
            Err(ConfirmError::Write("disk full".to_string()))
        );
    }

    #[tokio::test]
    async fn dropped_token_aborts() {
        let group = ConfirmGroup::new();
        drop(group.token());
        assert_eq!(group.wait().await, Err(ConfirmError::Aborted));
    }

    #[tokio::test]
    async fn no_tokens() {
        assert_eq!(ConfirmGroup::new().wait().await, Ok(()));
    }
}
