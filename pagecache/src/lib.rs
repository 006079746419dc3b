//! The cache control engine for the NBD agent: a per-page state machine
//! which decides what I/O has to happen (open/zero/download/upload/evict)
//! without performing any of it.  The decision functions are pure so that
//! they can be tested without a filesystem or a network; the executor that
//! applies their actions lives in the `siaobject` crate.

pub mod base_types;
mod brain;
mod page_map;

pub use brain::CacheBrain;
pub use page_map::determine_pages;
pub use page_map::PageAccess;
