use std::convert::TryFrom;
use std::fmt::*;

/// The unit of caching and of remote storage.  Page files on disk and page
/// objects in the remote store are exactly this large; the last page of an
/// export whose size is not a multiple is still stored full-sized.
pub const PAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Number of pages covering a device of `size` bytes.
pub fn page_count_for_size(size: u64) -> usize {
    usize::try_from((size + PAGE_SIZE - 1) / PAGE_SIZE).unwrap()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct PageId(pub u64);
impl Display for PageId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.0)
    }
}
impl PageId {
    /// Index into the per-page tables.  Page ids are bounded by the page
    /// count, which fits in memory many times over (a 1 TiB export is
    /// 16384 pages).
    pub fn as_index(self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageState {
    /// Never written, never downloaded; reads as all-zero.  No local file,
    /// no remote object.
    Zero,
    /// Durable in the remote store, no local file.
    NotCached,
    /// Local file matches the remote object.
    CachedUnchanged,
    /// Local file has writes the remote store does not.
    CachedChanged,
    /// Local file is dirty and a snapshot of it is being uploaded.  The
    /// local file keeps serving reads while the upload runs.
    CachedUploading,
}

/// The cached pages are exactly those with an open file handle in the
/// executor's table.
pub fn is_cached(state: PageState) -> bool {
    matches!(
        state,
        PageState::CachedUnchanged | PageState::CachedChanged | PageState::CachedUploading
    )
}

/// What the brain asks the executor to do.  Action lists are ordered and
/// applied sequentially; execution stops early at `WaitAndRetry`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    ZeroCache(PageId),
    OpenFile(PageId),
    CloseFile(PageId),
    DeleteCache(PageId),
    Download(PageId),
    StartUpload(PageId),
    PostponeUpload(PageId),
    WaitAndRetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count_for_size() {
        assert_eq!(page_count_for_size(PAGE_SIZE), 1);
        assert_eq!(page_count_for_size(PAGE_SIZE + 1), 2);
        assert_eq!(page_count_for_size(3 * PAGE_SIZE), 3);
        assert_eq!(page_count_for_size(1_099_511_627_776), 16384);
    }
}
