//! The I/O side of the cache: applies the brain's actions to the cache
//! directory and the remote store, and serializes client reads/writes, the
//! maintenance tick and shutdown under one lock.  The lock is held across
//! remote transfers; a client therefore waits at most one page worth of
//! remote I/O before its own access proceeds, and every brain transition is
//! committed before anything observes the corresponding I/O result.

use crate::sia_access::RemoteStorage;
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use log::*;
use pagecache::base_types::{page_count_for_size, Action, PageId, PageState, PAGE_SIZE};
use pagecache::{determine_pages, CacheBrain};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use util::get_tunable;

lazy_static! {
    static ref WAIT_INTERVAL: Duration = Duration::from_secs(get_tunable("wait_interval_secs", 5));
}

const WRITE_THROTTLE_INTERVAL: Duration = Duration::from_millis(5);
const WRITE_THROTTLE_LEEWAY: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BackendState {
    Available,
    ShuttingDown,
    Unavailable,
}

struct CacheState {
    brain: CacheBrain,
    // one open handle per cached page, none otherwise
    files: Vec<Option<Arc<File>>>,
    backend_state: BackendState,
}

pub struct BackendSettings {
    pub size: u64,
    pub hard_max_cached: usize,
    pub soft_max_cached: usize,
    pub idle_interval: Duration,
}

#[derive(Clone)]
pub struct Backend {
    state: Arc<Mutex<CacheState>>,
    remote: Arc<dyn RemoteStorage>,
    cache_dir: Arc<PathBuf>,
    size: u64,
}

impl Backend {
    pub async fn new(
        settings: BackendSettings,
        remote: Arc<dyn RemoteStorage>,
        cache_dir: PathBuf,
    ) -> Result<Backend> {
        info!("storing cache in {}", cache_dir.display());
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&cache_dir)
            .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;

        let page_count = page_count_for_size(settings.size);
        let brain = CacheBrain::new(
            page_count,
            settings.hard_max_cached,
            settings.soft_max_cached,
            settings.idle_interval,
        )?;

        let mut cache = CacheState {
            brain,
            files: vec![None; page_count],
            backend_state: BackendState::Available,
        };

        // Whatever the remote catalog reports holding is accepted as
        // durable; the bootstrap listing skips the redundancy bar.
        for info in remote.list_pages().await.context("listing remote pages")? {
            if info.page.as_index() >= page_count {
                warn!("remote store holds out-of-range page {}", info.page);
                continue;
            }
            if info.upload_complete(false) {
                cache.brain.assume_uploaded(info.page);
            }
        }

        // Local page files are leftovers of an earlier run.  There is no
        // record of whether they made it to the remote store, so take the
        // durable option and treat them all as unsynced.
        let mut actions = Vec::new();
        for entry in std::fs::read_dir(&*cache_dir)
            .with_context(|| format!("scanning cache directory {}", cache_dir.display()))?
        {
            let entry = entry?;
            let page = match page_from_cache_file(&entry.file_name()) {
                Some(page) => page,
                None => continue,
            };
            if page.as_index() >= page_count {
                warn!("ignoring out-of-range cache file for page {}", page);
                continue;
            }
            info!(
                "cache for page {} found - assuming it contains unsynced data",
                page
            );
            cache.brain.assume_unsynced(page);
            actions.push(Action::OpenFile(page));
        }

        let backend = Backend {
            state: Arc::new(Mutex::new(cache)),
            remote,
            cache_dir: Arc::new(cache_dir),
            size: settings.size,
        };

        {
            let mut cache = backend.state.lock().await;
            backend.handle_actions(&mut cache, &actions).await?;
        }

        backend.spawn_maintenance();
        Ok(backend)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn available(&self) -> bool {
        self.state.lock().await.backend_state == BackendState::Available
    }

    fn cache_path(&self, page: PageId) -> PathBuf {
        self.cache_dir.join(format!("page{}", page))
    }

    /// Apply a list of brain actions in order.  Returns `Ok(true)` if a
    /// `WaitAndRetry` stopped execution early.  On error the prefix of
    /// actions already applied stands, matching the state the brain
    /// committed when it emitted them.
    async fn handle_actions(&self, cache: &mut CacheState, actions: &[Action]) -> Result<bool> {
        for action in actions {
            match *action {
                Action::ZeroCache(page) => {
                    debug!("initializing cache for page {} with zeroes", page);

                    let file = page_file(cache, page);
                    // A hole reads back as zeroes; no need to write 64 MiB.
                    file.set_len(PAGE_SIZE)
                        .with_context(|| format!("zeroing cache file for page {}", page))?;
                }
                Action::OpenFile(page) => {
                    if cache.files[page.as_index()].is_some() {
                        panic!("file handling is inconsistent: page {} already open", page);
                    }

                    let path = self.cache_path(page);
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .mode(0o600)
                        .open(&path)
                        .with_context(|| format!("opening cache file {}", path.display()))?;
                    cache.files[page.as_index()] = Some(Arc::new(file));
                }
                Action::CloseFile(page) => {
                    if cache.files[page.as_index()].take().is_none() {
                        panic!("file handling is inconsistent: page {} not open", page);
                    }
                }
                Action::DeleteCache(page) => {
                    debug!("deleting cache for page {}", page);

                    let path = self.cache_path(page);
                    std::fs::remove_file(&path)
                        .with_context(|| format!("deleting cache file {}", path.display()))?;
                }
                Action::Download(page) => {
                    info!("downloading page {}", page);

                    let path = self.cache_path(page);
                    if let Err(e) = self.remote.download(page, &path).await {
                        // Undo the admission; a partial file must not be
                        // mistaken for unsynced data on a later restart.
                        let _ = std::fs::remove_file(&path);
                        cache.brain.rollback_download(page);
                        return Err(e);
                    }
                }
                Action::StartUpload(page) => {
                    info!("uploading page {}", page);

                    self.remote.start_upload(page, &self.cache_path(page)).await?;
                }
                Action::PostponeUpload(page) => {
                    info!("postponing upload for page {}", page);

                    self.remote.delete(page).await?;
                }
                Action::WaitAndRetry => {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Run the per-page admission loop for one access: ask the brain what
    /// has to happen, do it, and back off with the lock released while the
    /// cache is saturated.
    async fn prepare_access<'a>(
        &'a self,
        mut cache: MutexGuard<'a, CacheState>,
        page: PageId,
        is_write: bool,
    ) -> Result<MutexGuard<'a, CacheState>> {
        loop {
            let actions = cache.brain.prepare_access(page, is_write, Instant::now());
            let retry = self.handle_actions(&mut cache, &actions).await?;
            if !retry {
                return Ok(cache);
            }

            drop(cache);
            sleep(*WAIT_INTERVAL).await;
            cache = self.state.lock().await;
            if cache.backend_state != BackendState::Available {
                bail!("backend is no longer available");
            }
        }
    }

    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut cache = self.state.lock().await;
        if cache.backend_state != BackendState::Available {
            bail!("backend is no longer available");
        }

        let mut n = 0;
        for pa in determine_pages(offset, buf.len()) {
            cache = self.prepare_access(cache, pa.page, false).await?;

            let file = page_file(&cache, pa.page);
            let data = read_page_slice(file, pa.offset_in_page, pa.length)
                .await
                .with_context(|| format!("reading cache file for page {}", pa.page))?;
            buf[pa.slice_low..pa.slice_high].copy_from_slice(&data);
            n += pa.length;
        }
        Ok(n)
    }

    pub async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut cache = self.state.lock().await;
        if cache.backend_state != BackendState::Available {
            bail!("backend is no longer available");
        }

        // Past the soft limit writers are slowed exponentially, giving the
        // upload pipeline a chance to catch up before the hard limit turns
        // admissions into retry loops.
        let throttle_level = cache.brain.cache_count() as i64
            - (cache.brain.soft_max_cached() + WRITE_THROTTLE_LEEWAY) as i64;
        if throttle_level >= 0 {
            let duration = WRITE_THROTTLE_INTERVAL * (1 << throttle_level.min(20)) as u32;
            trace!("write throttled for {:?}", duration);

            drop(cache);
            sleep(duration).await;
            cache = self.state.lock().await;
            if cache.backend_state != BackendState::Available {
                bail!("backend is no longer available");
            }
        }

        let mut n = 0;
        for pa in determine_pages(offset, buf.len()) {
            cache = self.prepare_access(cache, pa.page, true).await?;

            let file = page_file(&cache, pa.page);
            write_page_slice(file, pa.offset_in_page, buf[pa.slice_low..pa.slice_high].to_vec())
                .await
                .with_context(|| format!("writing cache file for page {}", pa.page))?;
            n += pa.length;
        }
        Ok(n)
    }

    fn spawn_maintenance(&self) {
        let backend = self.clone();
        tokio::spawn(async move {
            loop {
                {
                    let cache = backend.state.lock().await;
                    if cache.backend_state == BackendState::Unavailable {
                        return;
                    }
                }
                sleep(*WAIT_INTERVAL).await;
                if let Err(e) = backend.maintenance().await {
                    warn!("error while doing maintenance: {:#}", e);
                }
            }
        });
    }

    async fn maintenance(&self) -> Result<()> {
        let mut cache = self.state.lock().await;

        let actions = cache.brain.maintenance(Instant::now());
        self.handle_actions(&mut cache, &actions).await?;

        if !cache.brain.has_uploading_pages() {
            return Ok(());
        }

        // Some uploads are in flight; ask the remote store which of them
        // have completed with enough redundancy.
        for info in self.remote.list_pages().await? {
            if info.page.as_index() < cache.brain.page_count()
                && info.upload_complete(true)
                && cache.brain.state(info.page) == PageState::CachedUploading
            {
                info!("upload complete for page {}", info.page);
                cache.brain.complete_upload(info.page);
            }
        }

        Ok(())
    }

    /// Drain the cache and make the backend unavailable.  A thorough
    /// shutdown uploads all dirty pages first and blocks until their
    /// completion is observed; a fast one leaves them on disk for the next
    /// startup to re-discover.
    pub async fn shutdown(&self, thorough: bool) -> Result<()> {
        info!(
            "shutting down backend ({})",
            if thorough { "thorough" } else { "fast" }
        );

        let mut cache = self.state.lock().await;
        cache.backend_state = BackendState::ShuttingDown;

        loop {
            let actions = cache.brain.prepare_shutdown(thorough);
            let retry = self.handle_actions(&mut cache, &actions).await?;
            if !retry {
                break;
            }

            // The maintenance tick observes upload completions while we
            // sleep with the lock released.
            drop(cache);
            sleep(*WAIT_INTERVAL).await;
            cache = self.state.lock().await;
        }

        for page in 0..cache.brain.page_count() {
            let page = PageId(page as u64);
            if self.cache_path(page).exists() {
                info!(
                    "fast shutdown leaves unsynced changes in cache for page {}",
                    page
                );
            }
        }

        cache.backend_state = BackendState::Unavailable;
        Ok(())
    }

    /// Block until the backend has become unavailable.
    pub async fn wait(&self) {
        loop {
            {
                let cache = self.state.lock().await;
                if cache.backend_state == BackendState::Unavailable {
                    return;
                }
            }
            sleep(*WAIT_INTERVAL).await;
        }
    }
}

fn page_file(cache: &CacheState, page: PageId) -> Arc<File> {
    match &cache.files[page.as_index()] {
        Some(file) => file.clone(),
        None => panic!("file handling is inconsistent: page {} not open", page),
    }
}

fn page_from_cache_file(name: &OsStr) -> Option<PageId> {
    let digits = name.to_str()?.strip_prefix("page")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(PageId)
}

async fn read_page_slice(file: Arc<File>, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0; length];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    })
    .await
    .unwrap()
}

async fn write_page_slice(file: Arc<File>, offset: u64, data: Vec<u8>) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
        .await
        .unwrap()
}
