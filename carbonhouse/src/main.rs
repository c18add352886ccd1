//! Entrypoint of the carbonhouse binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use std::{num::NonZeroUsize, path::PathBuf};

use carbonhouse::{
    VERSION_STRING, app,
    commands::{cat, recover},
    config::{Config as FileConfig, DEFAULT_CONFIG_PATH},
};
use carbonhouse_clap_blocks::{
    logging::{LoggingConfig, LoggingDefaults},
    tokio::TokioConfig,
};
use dotenvy::dotenv;
use tracing::info;

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "carbonhouse",
    version = &VERSION_STRING[..],
    about = "Graphite and Prometheus ingestion agent for ClickHouse",
    long_about = r#"Graphite and Prometheus ingestion agent for ClickHouse

Examples:
    # Run the agent with the default config file
    carbonhouse

    # Write a starting point for a config file
    carbonhouse print-default-config > /etc/carbonhouse/carbonhouse.toml

    # Validate a config file
    carbonhouse -c ./carbonhouse.toml check-config

    # Run with debug logging
    carbonhouse -c ./carbonhouse.toml -vv run

    # Inspect a stage file
    carbonhouse cat /data/carbonhouse/default.1556265600000000000
"#
)]
struct Config {
    /// Config file
    #[clap(
        short = 'c',
        long = "config",
        env = "CARBONHOUSE_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        global = true,
        action
    )]
    config: PathBuf,

    #[clap(flatten)]
    runtime_config: TokioConfig,

    #[clap(flatten)]
    logging_config: LoggingConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the agent (the default)
    Run,

    /// Load and validate the config file
    CheckConfig,

    /// Print the default config
    PrintDefaultConfig,

    /// Print the records of a stage file as tab separated text
    Cat {
        /// Stage file
        file: PathBuf,
    },

    /// Write the readable records of a damaged stage file to stdout
    Recover {
        /// Stage file
        file: PathBuf,
    },

    /// Print the version
    Version,
}

fn main() -> Result<(), std::io::Error> {
    #[cfg(unix)]
    install_crash_handler(); // attempt to render a useful stacktrace to stderr

    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    match config.command.unwrap_or(Command::Run) {
        Command::Version => println!("{}", &*VERSION_STRING),
        Command::PrintDefaultConfig => match FileConfig::example().to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => fail("Rendering config failed", e),
        },
        Command::CheckConfig => match FileConfig::load(Some(&config.config)) {
            Ok(_) => println!("{}: ok", config.config.display()),
            Err(e) => fail("Config check failed", e),
        },
        Command::Cat { file } => {
            if let Err(e) = cat::command(&file) {
                fail("Cat command failed", e)
            }
        }
        Command::Recover { file } => {
            if let Err(e) = recover::command(&file) {
                fail("Recover command failed", e)
            }
        }
        Command::Run => {
            let file_config = match FileConfig::load(Some(&config.config)) {
                Ok(c) => c,
                Err(e) => fail("Loading config failed", e),
            };

            let default_threads = NonZeroUsize::new(file_config.common.max_cpu);
            let worker_threads = match config.runtime_config.num_threads.or(default_threads) {
                Some(n) => n,
                None => std::thread::available_parallelism()?,
            };
            let tokio_runtime = config
                .runtime_config
                .builder(Some(worker_threads))?
                .build()?;

            let defaults = LoggingDefaults {
                filter: file_config.logging.level.clone(),
                destination: file_config.logging.file.clone(),
                format: file_config.logging.format,
            };
            if let Err(e) = config.logging_config.install_global_subscriber(&defaults) {
                fail("Initializing logs failed", e);
            }

            let config_path = config.config.clone();
            tokio_runtime.block_on(async move {
                info!(
                    version = %&*VERSION_STRING,
                    config = %config_path.display(),
                    worker_threads = worker_threads.get(),
                    "starting carbonhouse"
                );
                if let Err(e) = app::run(&file_config, worker_threads.get() * 2).await {
                    fail("Run command failed", e)
                }
            });
        }
    }

    Ok(())
}

fn fail(what: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("{what}: {e}");
    std::process::exit(ReturnCode::Failure as _)
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

#[cfg(unix)]
fn install_crash_handler() {
    unsafe {
        set_signal_handler(libc::SIGSEGV, signal_handler); // handle segfaults
        set_signal_handler(libc::SIGILL, signal_handler); // handle stack overflow and unsupported CPUs
        set_signal_handler(libc::SIGBUS, signal_handler); // handle invalid memory access
    }
}

#[cfg(unix)]
unsafe extern "C" fn signal_handler(sig: i32) {
    use backtrace::Backtrace;
    use std::process::abort;
    let name = std::thread::current()
        .name()
        .map(|n| format!(" for thread \"{n}\""))
        .unwrap_or_default();
    eprintln!(
        "Signal {}, Stack trace{}\n{:?}",
        sig,
        name,
        Backtrace::new()
    );
    abort();
}

#[cfg(unix)]
unsafe fn set_signal_handler(signal: libc::c_int, handler: unsafe extern "C" fn(libc::c_int)) {
    use libc::{sigaction, sigfillset, sighandler_t};
    // SAFETY: sigset_t and sigaction are plain C structs for which all zeroes
    // is a valid value.
    let mut sigset = unsafe { std::mem::zeroed() };

    // Block all signals during the handler.
    if unsafe { sigfillset(&mut sigset) } != -1 {
        let mut action: sigaction = unsafe { std::mem::zeroed() };
        action.sa_mask = sigset;
        action.sa_sigaction = handler as sighandler_t;

        unsafe { sigaction(signal, &action, std::ptr::null_mut()) };
    }
}
