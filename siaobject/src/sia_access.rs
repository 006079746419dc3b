//! Client for the remote half of the cache: page objects stored on the Sia
//! network through the local siad renter API.  The `RemoteStorage` trait is
//! the contract the backend programs against; `SiaAccess` is the production
//! implementation.  Uploads only start here; completion is observed later
//! through `list_pages`, once the renter reports the object available,
//! recoverable and redundant enough.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::*;
use pagecache::base_types::PageId;
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use util::get_tunable;

pub const SIA_PATH_PREFIX: &str = "nbd";

lazy_static! {
    static ref DATA_PIECES: u32 = get_tunable("data_pieces", 10);
    static ref PARITY_PIECES: u32 = get_tunable("parity_pieces", 20);
    static ref MINIMUM_REDUNDANCY: f64 = get_tunable("minimum_redundancy", 2.5);
    // log operations that take longer than this with info!()
    static ref LONG_OPERATION_DURATION: Duration =
        Duration::from_secs(get_tunable("long_operation_secs", 2));
}

/// One page object as reported by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFileInfo {
    pub page: PageId,
    pub available: bool,
    pub recoverable: bool,
    pub redundancy: f64,
}

impl PageFileInfo {
    /// Whether the object can be treated as durably stored.  During
    /// bootstrap the redundancy bar is waived: whatever the remote store
    /// reports holding is accepted as-is.
    pub fn upload_complete(&self, check_redundancy: bool) -> bool {
        self.available
            && self.recoverable
            && (!check_redundancy || self.redundancy >= *MINIMUM_REDUNDANCY)
    }
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Enumerate the page objects under the configured prefix.
    async fn list_pages(&self) -> Result<Vec<PageFileInfo>>;

    /// Fetch a page object into `destination`; returns once the full file
    /// is on disk.
    async fn download(&self, page: PageId, destination: &Path) -> Result<()>;

    /// Begin an asynchronous, erasure-coded upload of `source`.  Returns
    /// once the upload is accepted, not once it is complete.
    async fn start_upload(&self, page: PageId, source: &Path) -> Result<()>;

    /// Remove the page object; also cancels any in-progress upload of it.
    async fn delete(&self, page: PageId) -> Result<()>;
}

pub fn as_sia_path(page: PageId) -> String {
    format!("{}/page{}", SIA_PATH_PREFIX, page)
}

pub fn page_from_sia_path(sia_path: &str) -> Option<PageId> {
    let digits = sia_path.strip_prefix(SIA_PATH_PREFIX)?.strip_prefix("/page")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(PageId)
}

#[derive(Debug, Deserialize)]
struct RenterFile {
    siapath: String,
    available: bool,
    recoverable: bool,
    redundancy: f64,
}

#[derive(Debug, Deserialize)]
struct RenterFiles {
    #[serde(default)]
    files: Vec<RenterFile>,
}

async fn timed<F, T>(msg: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    trace!("{}: begin", msg);
    let begin = Instant::now();
    let result = fut.await;
    let elapsed = begin.elapsed();
    trace!("{}: returned in {}ms", msg, elapsed.as_millis());
    if elapsed > *LONG_OPERATION_DURATION {
        info!(
            "long completion: {}: returned in {:.1}s",
            msg,
            elapsed.as_secs_f64()
        );
    }
    result.with_context(|| format!("Failed to {}", msg))
}

pub struct SiaAccess {
    client: reqwest::Client,
    api_base: Url,
    password: String,
}

impl SiaAccess {
    pub fn new(daemon_address: &str, password: &str) -> Result<SiaAccess> {
        info!("Sia daemon: {}", daemon_address);

        // siad rejects requests that don't identify as the Sia agent.
        let client = reqwest::Client::builder()
            .user_agent("Sia-Agent")
            .build()
            .context("building HTTP client")?;
        let api_base = Url::parse(&format!("http://{}/", daemon_address))
            .with_context(|| format!("invalid daemon address {}", daemon_address))?;

        Ok(SiaAccess {
            client,
            api_base,
            password: password.to_owned(),
        })
    }

    fn api_url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .api_base
            .join(path)
            .with_context(|| format!("invalid API path {}", path))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn api_get(&self, url: Url) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url.clone())
            .basic_auth("", Some(&self.password))
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        Self::check_status(url, response).await
    }

    async fn api_post(&self, url: Url) -> Result<()> {
        let response = self
            .client
            .post(url.clone())
            .basic_auth("", Some(&self.password))
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        Self::check_status(url, response).await?;
        Ok(())
    }

    async fn check_status(url: Url, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{}: {}: {}", url, status, body.trim()));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteStorage for SiaAccess {
    async fn list_pages(&self) -> Result<Vec<PageFileInfo>> {
        // The cached view is good enough here: completion is polled
        // repeatedly, so a slightly stale answer only delays a transition
        // by one tick.
        let url = self.api_url("renter/files", &[("cached", "true".to_string())])?;
        timed("list pages", async {
            let renter_files: RenterFiles = self.api_get(url).await?.json().await?;
            Ok(renter_files
                .files
                .into_iter()
                .filter_map(|file| {
                    page_from_sia_path(&file.siapath).map(|page| PageFileInfo {
                        page,
                        available: file.available,
                        recoverable: file.recoverable,
                        redundancy: file.redundancy,
                    })
                })
                .collect())
        })
        .await
    }

    async fn download(&self, page: PageId, destination: &Path) -> Result<()> {
        // siad writes the destination file itself; the request returns
        // once the transfer is complete.
        let url = self.api_url(
            &format!("renter/download/{}", as_sia_path(page)),
            &[
                ("destination", destination.display().to_string()),
                ("async", "false".to_string()),
            ],
        )?;
        timed(&format!("download page {}", page), async {
            self.api_get(url).await?;
            Ok(())
        })
        .await
    }

    async fn start_upload(&self, page: PageId, source: &Path) -> Result<()> {
        // Workaround for force=true being unreliable: delete any existing
        // object first and ignore the outcome.
        let _ = self.delete(page).await;

        let url = self.api_url(
            &format!("renter/upload/{}", as_sia_path(page)),
            &[
                ("source", source.display().to_string()),
                ("datapieces", DATA_PIECES.to_string()),
                ("paritypieces", PARITY_PIECES.to_string()),
                ("force", "true".to_string()),
            ],
        )?;
        timed(&format!("start upload of page {}", page), self.api_post(url)).await
    }

    async fn delete(&self, page: PageId) -> Result<()> {
        let url = self.api_url(&format!("renter/delete/{}", as_sia_path(page)), &[])?;
        timed(&format!("delete page {}", page), self.api_post(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sia_path_round_trip() {
        assert_eq!(as_sia_path(PageId(0)), "nbd/page0");
        assert_eq!(as_sia_path(PageId(17)), "nbd/page17");
        assert_eq!(page_from_sia_path("nbd/page0"), Some(PageId(0)));
        assert_eq!(page_from_sia_path("nbd/page12345"), Some(PageId(12345)));
    }

    #[test]
    fn test_foreign_sia_paths_are_ignored() {
        assert_eq!(page_from_sia_path("nbd/page"), None);
        assert_eq!(page_from_sia_path("nbd/page12x"), None);
        assert_eq!(page_from_sia_path("nbd/other3"), None);
        assert_eq!(page_from_sia_path("backups/page3"), None);
        assert_eq!(page_from_sia_path("nbd"), None);
    }

    #[test]
    fn test_upload_complete_predicate() {
        let mut info = PageFileInfo {
            page: PageId(1),
            available: true,
            recoverable: true,
            redundancy: 3.0,
        };
        assert!(info.upload_complete(true));

        info.redundancy = 1.0;
        assert!(!info.upload_complete(true));
        // bootstrap trusts the catalog regardless of redundancy
        assert!(info.upload_complete(false));

        info.available = false;
        assert!(!info.upload_complete(false));
    }

    #[test]
    fn test_renter_files_parsing() {
        let body = r#"{
            "files": [
                {"siapath": "nbd/page3", "available": true, "recoverable": true,
                 "redundancy": 2.7, "filesize": 67108864},
                {"siapath": "unrelated/file", "available": true, "recoverable": true,
                 "redundancy": 3.0}
            ]
        }"#;
        let renter_files: RenterFiles = serde_json::from_str(body).unwrap();
        assert_eq!(renter_files.files.len(), 2);
        assert_eq!(page_from_sia_path(&renter_files.files[0].siapath), Some(PageId(3)));
        assert_eq!(page_from_sia_path(&renter_files.files[1].siapath), None);
    }

    #[test]
    fn test_renter_files_parsing_with_no_files() {
        let renter_files: RenterFiles = serde_json::from_str("{}").unwrap();
        assert!(renter_files.files.is_empty());
    }
}
