//! Manage agent shutdown
//!
//! Data flows from the receivers through the stage writer to the uploaders,
//! so the components have to stop in that order: nothing may still be
//! writing into the stage when the writer closes its file, and the uploaders
//! should see the final file before they stop.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! Components [`register`][ShutdownManager::register] for a [`Stage`] and
//! receive a [`ShutdownToken`]. When [`shutdown`][ShutdownManager::shutdown]
//! runs, the stages are cancelled one after the other; a stage is only
//! cancelled once every token of the stages before it signaled
//! [`complete`][ShutdownToken::complete].
//!
//! A component that hits an unrecoverable state can
//! [`trigger_shutdown`][ShutdownToken::trigger_shutdown], which wakes
//! [`ShutdownManager::requested`] the same way a signal would.
use std::{io, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");
    Ok(())
}

/// `SIGUSR1`, which asks the uploaders to forget their caches.
#[cfg(unix)]
#[derive(Debug)]
pub struct CacheResetSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl CacheResetSignal {
    pub fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::user_defined1())?))
    }

    /// Completes on the next signal, `None` once no more can arrive.
    pub async fn recv(&mut self) -> Option<()> {
        self.0.recv().await?;
        info!("received SIGUSR1");
        Some(())
    }
}

/// Components in the order they are stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Listeners and parsers.
    Receivers,
    /// The stage writer, which drains the write channel.
    Writer,
    Uploaders,
    /// Self-metrics and the debug server.
    Collector,
}

impl Stage {
    pub const ALL: [Self; 4] = [Self::Receivers, Self::Writer, Self::Uploaders, Self::Collector];
}

#[derive(Debug, Default)]
struct StageState {
    token: CancellationToken,
    tasks: TaskTracker,
}

/// Manage agent shutdown
#[derive(Debug)]
pub struct ShutdownManager {
    stages: [StageState; 4],
    requested: CancellationToken,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            stages: Default::default(),
            requested: CancellationToken::new(),
        }
    }

    fn stage(&self, stage: Stage) -> &StageState {
        &self.stages[stage as usize]
    }

    /// Register a component of `stage` that needs to clean up before the
    /// next stage may stop.
    ///
    /// The caller must invoke [`complete`][ShutdownToken::complete] for
    /// shutdown to proceed past `stage`.
    pub fn register(&self, stage: Stage) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        let state = self.stage(stage);
        state.tasks.spawn(rx);
        ShutdownToken::new(state.token.clone(), self.requested.clone(), tx)
    }

    /// Completes when shutdown was requested by a component.
    pub async fn requested(&self) {
        self.requested.cancelled().await;
    }

    /// Stop every stage in order, waiting for each to complete.
    pub async fn shutdown(&self) {
        for stage in Stage::ALL {
            let state = self.stage(stage);
            info!(?stage, "stopping");
            state.token.cancel();
            state.tasks.close();
            state.tasks.wait().await;
        }
        info!("shutdown complete");
    }
}

/// A token that a component can obtain via [`register`][ShutdownManager::register]
///
/// This implements [`Clone`] so that a component that obtains it can make
/// copies for sub-tasks.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    requested: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(
        token: CancellationToken,
        requested: CancellationToken,
        complete_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            token,
            requested,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Ask for the whole agent to stop due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.requested.cancel();
    }

    /// Future that completes when this token's stage is stopping
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// The stage's cancellation, for components driven by a
    /// [`CancellationToken`].
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal that the component that owns this token finished cleaning up
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
