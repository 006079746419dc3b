//! Process bring-up: logging, the exclusive cache-directory lock, the
//! tokio runtime, and the signal-driven shutdown sequence.

use crate::backend::{Backend, BackendSettings};
use crate::nbd::NbdServer;
use crate::paths;
use crate::sia_access::SiaAccess;
use anyhow::{Context, Result};
use fs2::FileExt;
use log::*;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::mem;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

const LOG_PATTERN: &str = "[{d(%Y-%m-%d %H:%M:%S%.3f)}][{t}][{l}] {m}{n}";

fn verbosity_level(verbosity: u64) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Route log output to the console, to a file, or per a log4rs yaml when
/// the operator brings their own.
pub fn setup_logging(verbosity: u64, file_name: Option<&str>, log_config: Option<&str>) {
    if let Some(config_file) = log_config {
        log4rs::init_file(config_file, Default::default()).unwrap();
        return;
    }

    let (name, appender): (&str, Box<dyn Append>) = match file_name {
        Some(logfile) => (
            "logfile",
            Box::new(
                FileAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                    .build(logfile)
                    .unwrap(),
            ),
        ),
        None => (
            "stdout",
            Box::new(
                ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                    .build(),
            ),
        ),
    };

    let config = Config::builder()
        .appender(Appender::builder().build(name, appender))
        // hyper logs every connection event at debug; cap it at info so
        // page transfers stay readable
        .logger(Logger::builder().build("hyper", LevelFilter::Info))
        .build(
            Root::builder()
                .appender(name)
                .build(verbosity_level(verbosity)),
        )
        .unwrap();

    log4rs::init_config(config).unwrap();
}

/*
 * One agent per cache directory: the page files on disk and the brain's
 * notion of which pages exist must not diverge.  The lock file records the
 * owning pid so the operator can tell which process to stop.
 */
fn lock_cache_dir(cache_dir: &Path) -> Result<()> {
    let lock_path = cache_dir.join("sia-nbdserver.lock");
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&lock_path)
        .with_context(|| format!("creating lock file {}", lock_path.display()))?;

    if file.try_lock_exclusive().is_err() {
        let mut owner = String::new();
        let _ = file.read_to_string(&mut owner);
        error!(
            "cache directory {} is already in use by pid {}",
            cache_dir.display(),
            owner.trim()
        );
        process::exit(2);
    }

    file.set_len(0)
        .and_then(|_| write!(file, "{}", process::id()))
        .with_context(|| format!("writing pid to {}", lock_path.display()))?;

    // The lock lives as long as the file handle.  Leak the handle so its
    // destructor never runs and the lock holds until the process exits.
    mem::forget(file);
    Ok(())
}

pub struct StartSettings {
    pub size: u64,
    pub hard_max_cached: usize,
    pub soft_max_cached: usize,
    pub idle_interval: Duration,
    pub socket_path: PathBuf,
    pub sia_daemon_address: String,
    pub sia_password_file: PathBuf,
    pub fast_shutdown: bool,
}

pub fn start(settings: StartSettings) -> Result<()> {
    let cache_dir = paths::data_directory()?;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&cache_dir)
        .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;
    lock_cache_dir(&cache_dir)?;

    let password = paths::read_password_file(&settings.sia_password_file)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sia-nbd")
        .build()
        .unwrap()
        .block_on(async move {
            let sia_access = SiaAccess::new(&settings.sia_daemon_address, &password)?;
            let backend = Backend::new(
                BackendSettings {
                    size: settings.size,
                    hard_max_cached: settings.hard_max_cached,
                    soft_max_cached: settings.soft_max_cached,
                    idle_interval: settings.idle_interval,
                },
                Arc::new(sia_access),
                cache_dir,
            )
            .await
            .context("initializing backend")?;

            NbdServer::new(settings.socket_path, backend.clone()).start()?;

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }

            backend.shutdown(!settings.fast_shutdown).await?;
            backend.wait().await;
            Ok(())
        })
}
