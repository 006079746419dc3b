use crate::base_types::{is_cached, Action, PageId, PageState};
use anyhow::{bail, Result};
use std::time::{Duration, Instant};

struct PageDetails {
    state: PageState,
    // None until the first access of this run; sorts as oldest, so pages
    // recovered from a previous run are the first to upload or evict.
    last_access: Option<Instant>,
}

/// The decision-making core of the cache.  Owns the page-state table and
/// the cache counters and nothing else: no files, no sockets, no clock
/// beyond the `now` its callers pass in.  The caller (the backend) applies
/// the returned actions and serializes all calls under its own lock.
pub struct CacheBrain {
    cache_count: usize,
    hard_max_cached: usize,
    soft_max_cached: usize,
    idle_interval: Duration,
    pages: Vec<PageDetails>,
}

impl CacheBrain {
    pub fn new(
        page_count: usize,
        hard_max_cached: usize,
        soft_max_cached: usize,
        idle_interval: Duration,
    ) -> Result<CacheBrain> {
        if soft_max_cached >= hard_max_cached {
            bail!("soft limit needs to be lower than hard limit");
        }

        let mut pages = Vec::with_capacity(page_count);
        pages.resize_with(page_count, || PageDetails {
            state: PageState::Zero,
            last_access: None,
        });

        Ok(CacheBrain {
            cache_count: 0,
            hard_max_cached,
            soft_max_cached,
            idle_interval,
            pages,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn cache_count(&self) -> usize {
        self.cache_count
    }

    pub fn soft_max_cached(&self) -> usize {
        self.soft_max_cached
    }

    pub fn state(&self, page: PageId) -> PageState {
        self.pages[page.as_index()].state
    }

    pub fn has_uploading_pages(&self) -> bool {
        self.pages
            .iter()
            .any(|details| details.state == PageState::CachedUploading)
    }

    /// Decide what has to happen before `page` can be read or written
    /// through its cache file.  Admission of a new page is refused with
    /// `WaitAndRetry` while the cache sits at the hard limit; the access
    /// timestamp is only updated on the non-retry paths.
    pub fn prepare_access(&mut self, page: PageId, is_write: bool, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        let details = &mut self.pages[page.as_index()];
        if !is_cached(details.state) && self.cache_count >= self.hard_max_cached {
            // wait for maintenance to free up some space first
            actions.push(Action::WaitAndRetry);
            return actions;
        }

        match details.state {
            PageState::Zero => {
                actions.push(Action::OpenFile(page));
                actions.push(Action::ZeroCache(page));
                details.state = PageState::CachedChanged;
                self.cache_count += 1;
            }
            PageState::NotCached => {
                actions.push(Action::Download(page));
                actions.push(Action::OpenFile(page));
                details.state = if is_write {
                    PageState::CachedChanged
                } else {
                    PageState::CachedUnchanged
                };
                self.cache_count += 1;
            }
            PageState::CachedUnchanged => {
                if is_write {
                    details.state = PageState::CachedChanged;
                }
            }
            PageState::CachedChanged => {
                // no changes
            }
            PageState::CachedUploading => {
                if is_write {
                    // Cancel the in-flight upload by deleting the remote
                    // object; otherwise its completion would mark the page
                    // clean even though this write made the snapshot stale.
                    actions.push(Action::PostponeUpload(page));
                    details.state = PageState::CachedChanged;
                }
            }
        }

        self.pages[page.as_index()].last_access = Some(now);
        actions
    }

    /// Periodic housekeeping: evict clean pages and upload dirty ones, in
    /// LRU order, once the soft limit is reached, and upload dirty pages
    /// that have sat idle regardless of capacity.  The youngest third of
    /// the cache is left alone so a hot working set does not thrash.
    pub fn maintenance(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        let mut accesses: Vec<(Option<Instant>, PageId)> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, details)| is_cached(details.state))
            .map(|(i, details)| (details.last_access, PageId(i as u64)))
            .collect();

        // sort cached pages by oldest to newest access
        accesses.sort_by_key(|&(last_access, _)| last_access);

        for (i, &(last_access, page)) in accesses.iter().enumerate() {
            // Recent activity means being in the youngest 1/3 of the cache.
            let has_recent_activity = i > (self.soft_max_cached * 2) / 3;
            let is_idle = match last_access {
                Some(instant) => now > instant + self.idle_interval,
                None => true,
            };
            let soft_limit_reached = self.cache_count >= self.soft_max_cached;

            match self.pages[page.as_index()].state {
                PageState::CachedUnchanged => {
                    if soft_limit_reached && !has_recent_activity {
                        actions.push(Action::CloseFile(page));
                        actions.push(Action::DeleteCache(page));
                        self.pages[page.as_index()].state = PageState::NotCached;
                        self.cache_count -= 1;
                    }
                }
                PageState::CachedChanged => {
                    if (soft_limit_reached && !has_recent_activity) || is_idle {
                        actions.push(Action::StartUpload(page));
                        self.pages[page.as_index()].state = PageState::CachedUploading;
                    }
                }
                PageState::CachedUploading => {
                    // already on its way out
                }
                PageState::Zero | PageState::NotCached => {
                    panic!("page {} in access list but not cached", page)
                }
            }
        }

        actions
    }

    /// Drive the cache towards empty.  A thorough shutdown uploads every
    /// dirty page and asks the caller to wait for completions; a fast one
    /// cancels in-flight uploads so no remote operation races process
    /// exit, leaving the dirty files behind for the next startup.
    pub fn prepare_shutdown(&mut self, thorough: bool) -> Vec<Action> {
        let mut actions = Vec::new();

        for i in 0..self.pages.len() {
            let page = PageId(i as u64);
            match self.pages[i].state {
                PageState::CachedUnchanged => {
                    actions.push(Action::CloseFile(page));
                    actions.push(Action::DeleteCache(page));
                    self.pages[i].state = PageState::NotCached;
                    self.cache_count -= 1;
                }
                PageState::CachedChanged => {
                    if thorough {
                        actions.push(Action::StartUpload(page));
                        self.pages[i].state = PageState::CachedUploading;
                    }
                }
                PageState::CachedUploading => {
                    if !thorough {
                        actions.push(Action::PostponeUpload(page));
                        self.pages[i].state = PageState::CachedChanged;
                    }
                }
                PageState::Zero | PageState::NotCached => {}
            }
        }

        if thorough && self.cache_count > 0 {
            actions.push(Action::WaitAndRetry);
        }

        actions
    }

    /// An upload was observed complete and sufficiently redundant; the
    /// local file now matches the remote object.
    pub fn complete_upload(&mut self, page: PageId) {
        let details = &mut self.pages[page.as_index()];
        assert_eq!(details.state, PageState::CachedUploading);
        details.state = PageState::CachedUnchanged;
    }

    /// Bootstrap: the remote store reports holding this page.
    pub fn assume_uploaded(&mut self, page: PageId) {
        let details = &mut self.pages[page.as_index()];
        assert_eq!(details.state, PageState::Zero);
        details.state = PageState::NotCached;
    }

    /// Bootstrap: a cache file for this page survived a previous run and
    /// is assumed to contain unsynced writes.
    pub fn assume_unsynced(&mut self, page: PageId) {
        let details = &mut self.pages[page.as_index()];
        assert!(!is_cached(details.state));
        details.state = PageState::CachedChanged;
        self.cache_count += 1;
    }

    /// A `Download` failed before the page was usable; undo the admission
    /// so the next access starts over from `NotCached`.
    pub fn rollback_download(&mut self, page: PageId) {
        let details = &mut self.pages[page.as_index()];
        assert!(is_cached(details.state));
        details.state = PageState::NotCached;
        details.last_access = None;
        self.cache_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn set_page(brain: &mut CacheBrain, page: u64, state: PageState, last_access: Option<Instant>) {
        brain.pages[page as usize].state = state;
        brain.pages[page as usize].last_access = last_access;
    }

    #[test]
    fn test_new_rejects_soft_at_hard() {
        assert!(CacheBrain::new(1, 1, 1, secs(30)).is_err());
        assert!(CacheBrain::new(10, 4, 6, secs(30)).is_err());
        assert!(CacheBrain::new(10, 6, 4, secs(30)).is_ok());
    }

    #[test]
    fn test_maintenance_uploads_idle_dirty_pages() {
        let mut brain = CacheBrain::new(10, 6, 4, secs(30)).unwrap();

        let now = Instant::now();
        let actions = brain.maintenance(now);
        assert!(actions.is_empty(), "empty cache should require no maintenance");

        for i in 1..4 {
            set_page(&mut brain, i, PageState::CachedChanged, Some(now));
        }
        brain.cache_count = 3;
        let actions = brain.maintenance(now);
        assert!(actions.is_empty(), "recent writes should not trigger upload");

        let actions = brain.maintenance(now + secs(60));
        assert_eq!(actions.len(), 3, "expected three actions");
        for action in &actions {
            match action {
                Action::StartUpload(page) => {
                    assert_eq!(brain.state(*page), PageState::CachedUploading);
                }
                other => panic!("expected upload action, got {:?}", other),
            }
        }

        let actions = brain.maintenance(now + secs(60));
        assert!(actions.is_empty(), "should not trigger uploads again");
    }

    #[test]
    fn test_maintenance_applies_soft_limit() {
        let mut brain = CacheBrain::new(3, 2, 1, secs(30)).unwrap();

        let now = Instant::now();
        set_page(&mut brain, 2, PageState::CachedUnchanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.maintenance(now);
        assert_eq!(
            actions,
            vec![Action::CloseFile(PageId(2)), Action::DeleteCache(PageId(2))]
        );
        assert_eq!(brain.cache_count(), 0, "expected cache count to be adjusted");
        assert_eq!(brain.state(PageId(2)), PageState::NotCached);

        set_page(&mut brain, 2, PageState::CachedChanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.maintenance(now);
        assert_eq!(actions, vec![Action::StartUpload(PageId(2))]);
        assert_eq!(brain.state(PageId(2)), PageState::CachedUploading);

        let actions = brain.maintenance(now);
        assert!(actions.is_empty(), "should not trigger upload again");
    }

    #[test]
    fn test_maintenance_works_oldest_first() {
        let mut brain = CacheBrain::new(20, 10, 9, secs(90)).unwrap();

        let now = Instant::now();
        for i in 0..9 {
            set_page(
                &mut brain,
                i,
                PageState::CachedChanged,
                Some(now + secs(i)),
            );
        }
        brain.cache_count = 9;

        brain.pages[6].state = PageState::CachedUnchanged;
        brain.pages[8].state = PageState::CachedUnchanged;

        let actions = brain.maintenance(now + secs(60));
        assert_eq!(actions.len(), 8);

        for i in 0..6 {
            assert_eq!(actions[i], Action::StartUpload(PageId(i as u64)));
        }
        assert_eq!(actions[6], Action::CloseFile(PageId(6)));
        assert_eq!(actions[7], Action::DeleteCache(PageId(6)));
    }

    #[test]
    fn test_maintenance_evicts_oldest_clean_page() {
        let mut brain = CacheBrain::new(10, 6, 4, secs(30)).unwrap();

        let now = Instant::now();
        set_page(&mut brain, 2, PageState::CachedUnchanged, Some(now));
        set_page(&mut brain, 1, PageState::CachedUnchanged, Some(now + secs(1)));
        set_page(&mut brain, 3, PageState::CachedUnchanged, Some(now + secs(2)));
        set_page(&mut brain, 4, PageState::CachedUnchanged, Some(now + secs(3)));
        brain.cache_count = 4;

        let actions = brain.maintenance(now + secs(4));
        assert_eq!(
            actions,
            vec![Action::CloseFile(PageId(2)), Action::DeleteCache(PageId(2))],
            "expected oldest page to be deleted first"
        );
    }

    #[test]
    fn test_maintenance_protects_recently_used_pages() {
        let mut brain = CacheBrain::new(30, 20, 10, secs(30)).unwrap();

        let now = Instant::now();
        for i in 0..9 {
            set_page(&mut brain, i, PageState::CachedUploading, Some(now));
        }
        set_page(&mut brain, 9, PageState::CachedUnchanged, Some(now + secs(1)));
        brain.cache_count = 10;

        let actions = brain.maintenance(now + secs(2));
        assert!(
            actions.is_empty(),
            "expected no action if many older pages are uploading"
        );
    }

    #[test]
    fn test_prepare_access_admission() {
        let mut brain = CacheBrain::new(3, 2, 1, secs(30)).unwrap();

        let now = Instant::now();

        let actions = brain.prepare_access(PageId(2), false, now);
        assert_eq!(
            actions,
            vec![Action::OpenFile(PageId(2)), Action::ZeroCache(PageId(2))]
        );
        assert_eq!(brain.state(PageId(2)), PageState::CachedChanged);
        assert_eq!(brain.cache_count(), 1);

        set_page(&mut brain, 1, PageState::NotCached, None);
        let actions = brain.prepare_access(PageId(1), false, now + secs(1));
        assert_eq!(
            actions,
            vec![Action::Download(PageId(1)), Action::OpenFile(PageId(1))]
        );
        assert_eq!(brain.state(PageId(1)), PageState::CachedUnchanged);
        assert_eq!(brain.cache_count(), 2);

        // Hard limit reached: no admission, no timestamp update.
        set_page(&mut brain, 0, PageState::NotCached, None);
        let actions = brain.prepare_access(PageId(0), true, now + secs(2));
        assert_eq!(actions, vec![Action::WaitAndRetry]);
        assert_eq!(brain.state(PageId(0)), PageState::NotCached);
        assert_eq!(brain.pages[0].last_access, None);
        assert_eq!(brain.cache_count(), 2);

        // Maintenance frees space: the dirty page uploads, the clean one
        // is evicted once its upload has completed.
        let actions = brain.maintenance(now + secs(3));
        assert_eq!(actions, vec![Action::StartUpload(PageId(2))]);
        assert_eq!(brain.state(PageId(2)), PageState::CachedUploading);
        assert_eq!(brain.cache_count(), 2);

        brain.complete_upload(PageId(2));
        let actions = brain.maintenance(now + secs(3));
        assert_eq!(
            actions,
            vec![Action::CloseFile(PageId(2)), Action::DeleteCache(PageId(2))]
        );
        assert_eq!(brain.cache_count(), 1);

        let actions = brain.prepare_access(PageId(0), true, now + secs(4));
        assert_eq!(
            actions,
            vec![Action::Download(PageId(0)), Action::OpenFile(PageId(0))]
        );
        assert_eq!(brain.state(PageId(0)), PageState::CachedChanged);
        assert_eq!(brain.cache_count(), 2);
    }

    #[test]
    fn test_prepare_access_on_cached_pages() {
        let mut brain = CacheBrain::new(3, 2, 1, secs(30)).unwrap();

        let now = Instant::now();
        set_page(&mut brain, 2, PageState::CachedUnchanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.prepare_access(PageId(2), true, now);
        assert!(actions.is_empty());
        assert_eq!(brain.state(PageId(2)), PageState::CachedChanged);

        let actions = brain.prepare_access(PageId(2), true, now);
        assert!(actions.is_empty());

        let actions = brain.prepare_access(PageId(2), false, now);
        assert!(actions.is_empty(), "reads leave a dirty page dirty");
        assert_eq!(brain.state(PageId(2)), PageState::CachedChanged);

        // A write racing an in-flight upload cancels the upload.
        set_page(&mut brain, 2, PageState::CachedUploading, Some(now));
        let actions = brain.prepare_access(PageId(2), true, now);
        assert_eq!(actions, vec![Action::PostponeUpload(PageId(2))]);
        assert_eq!(brain.state(PageId(2)), PageState::CachedChanged);
        assert_eq!(brain.cache_count(), 1);

        // A read does not.
        set_page(&mut brain, 2, PageState::CachedUploading, Some(now));
        let actions = brain.prepare_access(PageId(2), false, now);
        assert!(actions.is_empty());
        assert_eq!(brain.state(PageId(2)), PageState::CachedUploading);
    }

    #[test]
    fn test_prepare_shutdown() {
        let mut brain = CacheBrain::new(10, 6, 4, secs(30)).unwrap();

        let actions = brain.prepare_shutdown(true);
        assert!(actions.is_empty(), "empty cache should shutdown right away");

        let now = Instant::now();
        set_page(&mut brain, 2, PageState::CachedUnchanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.prepare_shutdown(true);
        assert_eq!(
            actions,
            vec![Action::CloseFile(PageId(2)), Action::DeleteCache(PageId(2))]
        );
        assert_eq!(brain.state(PageId(2)), PageState::NotCached);
        assert_eq!(brain.cache_count(), 0);

        set_page(&mut brain, 3, PageState::CachedChanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.prepare_shutdown(true);
        assert_eq!(
            actions,
            vec![Action::StartUpload(PageId(3)), Action::WaitAndRetry]
        );
        assert_eq!(brain.state(PageId(3)), PageState::CachedUploading);
    }

    #[test]
    fn test_thorough_shutdown_converges_after_upload() {
        let mut brain = CacheBrain::new(5, 4, 2, secs(30)).unwrap();

        let now = Instant::now();
        set_page(&mut brain, 1, PageState::CachedChanged, Some(now));
        brain.cache_count = 1;

        let actions = brain.prepare_shutdown(true);
        assert_eq!(
            actions,
            vec![Action::StartUpload(PageId(1)), Action::WaitAndRetry]
        );

        // The upload is observed complete between retries.
        brain.complete_upload(PageId(1));

        let actions = brain.prepare_shutdown(true);
        assert_eq!(
            actions,
            vec![Action::CloseFile(PageId(1)), Action::DeleteCache(PageId(1))]
        );
        assert_eq!(brain.cache_count(), 0);

        assert!(brain.prepare_shutdown(true).is_empty());
        for i in 0..brain.page_count() {
            assert!(!is_cached(brain.state(PageId(i as u64))));
        }
    }

    #[test]
    fn test_fast_shutdown_postpones_uploads() {
        let mut brain = CacheBrain::new(5, 4, 2, secs(30)).unwrap();

        let now = Instant::now();
        set_page(&mut brain, 0, PageState::CachedUploading, Some(now));
        set_page(&mut brain, 1, PageState::CachedChanged, Some(now));
        brain.cache_count = 2;

        let actions = brain.prepare_shutdown(false);
        assert_eq!(actions, vec![Action::PostponeUpload(PageId(0))]);
        assert_eq!(brain.state(PageId(0)), PageState::CachedChanged);
        assert_eq!(brain.state(PageId(1)), PageState::CachedChanged);
        assert_eq!(brain.cache_count(), 2, "dirty pages stay behind on disk");
    }

    #[test]
    fn test_bootstrap_transitions() {
        let mut brain = CacheBrain::new(4, 3, 2, secs(30)).unwrap();

        brain.assume_uploaded(PageId(0));
        assert_eq!(brain.state(PageId(0)), PageState::NotCached);

        brain.assume_unsynced(PageId(1));
        assert_eq!(brain.state(PageId(1)), PageState::CachedChanged);
        assert_eq!(brain.cache_count(), 1);

        // A recovered page has no recorded access, so it is idle at the
        // very first maintenance pass.
        let actions = brain.maintenance(Instant::now());
        assert_eq!(actions, vec![Action::StartUpload(PageId(1))]);
    }

    #[test]
    fn test_rollback_download() {
        let mut brain = CacheBrain::new(4, 3, 2, secs(30)).unwrap();

        set_page(&mut brain, 2, PageState::NotCached, None);
        let actions = brain.prepare_access(PageId(2), false, Instant::now());
        assert_eq!(
            actions,
            vec![Action::Download(PageId(2)), Action::OpenFile(PageId(2))]
        );
        assert_eq!(brain.cache_count(), 1);

        brain.rollback_download(PageId(2));
        assert_eq!(brain.state(PageId(2)), PageState::NotCached);
        assert_eq!(brain.cache_count(), 0);
    }
}
