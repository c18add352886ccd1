//! Config for the tokio runtime that drives the agent.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

#[cfg(unix)]
fn set_current_thread_priority(prio: i32) {
    // on linux setpriority sets the current thread's priority
    // (as opposed to the current process).
    unsafe { libc::setpriority(0, 0, prio) };
}

/// CLI config for the tokio runtime.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct TokioConfig {
    /// Set the maximum number of runtime worker threads to use.
    ///
    /// Defaults to `max-cpu` from the config file, then to the number of
    /// logical cores on the system.
    #[clap(long = "num-threads", env = "CARBONHOUSE_NUM_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// Tokio runtime type.
    #[clap(
        long = "runtime-type",
        env = "CARBONHOUSE_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Specifies the limit for additional threads spawned by the runtime.
    ///
    /// Uploads to the store are produced on blocking threads.
    #[clap(
        long = "runtime-max-blocking-threads",
        env = "CARBONHOUSE_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool.
    #[clap(
        long = "runtime-thread-keep-alive",
        env = "CARBONHOUSE_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,

    /// Set thread priority of the runtime workers.
    #[clap(
        long = "runtime-thread-priority",
        env = "CARBONHOUSE_RUNTIME_THREAD_PRIORITY",
        action
    )]
    pub thread_priority: Option<i32>,
}

impl TokioConfig {
    /// Creates the tokio runtime builder.
    ///
    /// `default_threads` is used when `--num-threads` is not given.
    pub fn builder(
        &self,
        default_threads: Option<NonZeroUsize>,
    ) -> Result<::tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here!
        //
        // The subscriber is installed after the runtime exists, so use
        // eprintln!() instead of error!() and so on.

        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => ::tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => ::tokio::runtime::Builder::new_multi_thread(),
        };
        builder.enable_all();

        // set up proper thread names
        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "carbonhouse tokio {}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        // worker thread count
        let num_threads = match self.num_threads.or(default_threads) {
            None => std::thread::available_parallelism()?,
            Some(n) => n,
        };
        builder.worker_threads(num_threads.get());

        if let Some(x) = self.max_blocking_threads {
            builder.max_blocking_threads(x.get());
        }

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        #[allow(unused)]
        if let Some(x) = self.thread_priority {
            #[cfg(unix)]
            {
                builder.on_thread_start(move || set_current_thread_priority(x));
            }
            #[cfg(not(unix))]
            {
                eprintln!("WARN: setting worker thread priority not supported on this platform");
            }
        }

        Ok(builder)
    }
}
