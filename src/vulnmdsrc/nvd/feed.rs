//! Download and local caching of the yearly NVD JSON 1.1 feeds.
//!
//! Each yearly partition is published as `nvdcve-1.1-<year>.json.gz` next to
//! a small `nvdcve-1.1-<year>.meta` descriptor carrying the SHA-256 of the
//! uncompressed document. The hash keys the local copy
//! (`nvdcve-<year>-<hash>.json`), so unchanged partitions are never
//! downloaded twice.

use crate::error::{Error, Result};
use chrono::Datelike;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://nvd.nist.gov/feeds/json/cve/1.1";

/// First year with a published NVD feed.
pub const DEFAULT_FIRST_YEAR: i32 = 2002;

/// Outcome of a feed synchronization.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Local feed documents, one per synchronized year, oldest first.
    pub files: Vec<PathBuf>,
    /// Years that could not be synchronized, with the reason.
    pub failures: Vec<(i32, String)>,
    pub downloaded: usize,
    pub reused: usize,
}

enum Partition {
    Reused(PathBuf),
    Downloaded(PathBuf),
}

/// Keeps a local directory in sync with the NVD yearly feeds.
#[derive(Debug, Clone)]
pub struct FeedSynchronizer {
    client: reqwest::Client,
    base_url: String,
    first_year: i32,
    last_year: Option<i32>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl FeedSynchronizer {
    /// Creates a synchronizer for the feeds under `base_url`.
    ///
    /// `max_attempts` bounds the number of requests per file; rejected
    /// requests are retried after `retry_delay`.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("could not create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            first_year: DEFAULT_FIRST_YEAR,
            last_year: None,
            max_attempts: max_attempts.max(1),
            retry_delay,
        })
    }

    /// Restricts the synchronized years. `last_year` defaults to the current
    /// year.
    pub fn with_years(mut self, first_year: i32, last_year: Option<i32>) -> Self {
        self.first_year = first_year;
        self.last_year = last_year;
        self
    }

    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        let last = self.last_year.unwrap_or_else(|| chrono::Utc::now().year());
        self.first_year..=last
    }

    /// Synchronizes every yearly partition into `dir`.
    ///
    /// A partition that can't be fetched is logged and skipped; the other
    /// partitions are still synchronized. Fails only when `dir` can't be
    /// created or when no partition at all could be synchronized.
    pub async fn sync(&self, dir: &Path) -> Result<SyncReport> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(dir, e))?;

        let mut report = SyncReport::default();
        for year in self.years() {
            match self.sync_year(dir, year).await {
                Ok(Partition::Reused(path)) => {
                    report.reused += 1;
                    report.files.push(path);
                }
                Ok(Partition::Downloaded(path)) => {
                    report.downloaded += 1;
                    report.files.push(path);
                }
                Err(e) => {
                    warn!(year, error = %e, "skipping NVD feed partition");
                    report.failures.push((year, e.to_string()));
                }
            }
        }

        info!(
            downloaded = report.downloaded,
            reused = report.reused,
            failed = report.failures.len(),
            "synchronized NVD feeds"
        );

        if report.files.is_empty() && !report.failures.is_empty() {
            return Err(Error::Download {
                url: self.base_url.clone(),
                reason: format!("all {} feed partitions failed", report.failures.len()),
            });
        }
        Ok(report)
    }

    /// Removes the local feed directory and everything in it.
    pub async fn clean(&self, dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(dir = %dir.display(), "removed local NVD feeds");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(dir, e)),
        }
    }

    async fn sync_year(&self, dir: &Path, year: i32) -> Result<Partition> {
        let meta_url = format!("{}/nvdcve-1.1-{}.meta", self.base_url, year);
        let meta = self.fetch(&meta_url).await?;
        let hash = parse_meta_hash(&String::from_utf8_lossy(&meta)).ok_or_else(|| Error::Parse {
            path: meta_url.clone(),
            reason: "missing or invalid sha256 line".to_string(),
        })?;

        let path = dir.join(format!("nvdcve-{}-{}.json", year, hash));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(year, path = %path.display(), "reusing local NVD feed");
            return Ok(Partition::Reused(path));
        }

        let feed_url = format!("{}/nvdcve-1.1-{}.json.gz", self.base_url, year);
        let compressed = self.fetch(&feed_url).await?;

        let (target, dir) = (path.clone(), dir.to_path_buf());
        tokio::task::spawn_blocking(move || {
            store_feed(&compressed, &target, &feed_url)?;
            remove_superseded(&dir, year, &target);
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::io(&path, std::io::Error::other(e)))??;

        info!(year, path = %path.display(), "downloaded NVD feed");
        Ok(Partition::Downloaded(path))
    }

    /// GETs `url`, retrying rejected responses up to the attempt ceiling.
    /// Transport errors and timeouts fail immediately.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let download_error = |reason: String| Error::Download {
            url: url.to_string(),
            reason,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| download_error(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| download_error(e.to_string()))?;
                return Ok(body.to_vec());
            }

            if attempt >= self.max_attempts {
                return Err(download_error(format!(
                    "HTTP {} after {} attempts",
                    status, attempt
                )));
            }
            debug!(url, %status, attempt, "NVD request rejected, retrying");
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

/// Extracts the hash from the `sha256:<hex>` line of a `.meta` descriptor.
fn parse_meta_hash(meta: &str) -> Option<String> {
    meta.lines()
        .find_map(|line| line.trim().strip_prefix("sha256:"))
        .map(str::trim)
        .filter(|hash| !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

/// Decompresses a feed and writes it atomically to `path`.
fn store_feed(compressed: &[u8], path: &Path, url: &str) -> Result<()> {
    let mut document = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut document)
        .map_err(|e| Error::Download {
            url: url.to_string(),
            reason: format!("could not decompress feed: {}", e),
        })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &document).map_err(|e| Error::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

/// Removes older copies of the `year` partition.
fn remove_superseded(dir: &Path, year: i32, keep: &Path) {
    let prefix = format!("nvdcve-{}-", year);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let superseded = path != keep
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"));
        if superseded {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove superseded NVD feed");
            }
        }
    }
}
