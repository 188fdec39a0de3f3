//! Vulnerability metadata from the NIST National Vulnerability Database.
//!
//! [`NvdAppender`] indexes NVD JSON 1.1 feed documents by CVE identifier and
//! derives a [`Severity`] from their CVSS scores. The documents come either
//! from a pre-built dump (`<dump_dir>/nvd/*.json`) or, when configured with a
//! [`FeedSynchronizer`], from the NVD website, cached in the same directory.

pub mod feed;
mod types;

pub use feed::{FeedSynchronizer, SyncReport};

use super::{AppendFn, Appender, AppenderState, MetadataEnricher};
use crate::error::{Error, Result};
use crate::model::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvssV2 {
    pub vectors: String,
    pub score: f64,
    pub exploitability_score: f64,
    pub impact_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvssV3 {
    pub vectors: String,
    pub score: f64,
    pub exploitability_score: f64,
    pub impact_score: f64,
}

/// Scoring metadata for one CVE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub published_date_time: String,
    pub last_modified_date_time: String,
    #[serde(rename = "cvssv2")]
    pub cvss_v2: CvssV2,
    #[serde(rename = "cvssv3")]
    pub cvss_v3: CvssV3,
}

impl Metadata {
    /// The score used for severity: CVSS v3 when present, v2 otherwise.
    pub fn effective_score(&self) -> f64 {
        if self.cvss_v3.score != 0.0 {
            self.cvss_v3.score
        } else {
            self.cvss_v2.score
        }
    }
}

/// Maps a CVSS base score onto the qualitative scale of the CVSS v3.0
/// specification (table 14).
///
/// Scores in `[0, 1)` map to `Negligible` instead of the specified `None`.
pub fn severity_from_score(score: f64) -> Severity {
    match score {
        s if s < 1.0 => Severity::Negligible,
        s if s < 3.9 => Severity::Low,
        s if s < 6.9 => Severity::Medium,
        s if s < 8.9 => Severity::High,
        s if s <= 10.0 => Severity::Critical,
        _ => Severity::Unknown,
    }
}

/// Derives the severity of a CVE from its CVSS v3 score, or its v2 score
/// when no v3 score is available.
pub fn severity_from_cvss(metadata: &Metadata) -> Severity {
    severity_from_score(metadata.effective_score())
}

struct NvdEnricher {
    metadata: Metadata,
    summary: String,
}

impl MetadataEnricher for NvdEnricher {
    fn metadata(&self) -> serde_json::Value {
        serde_json::to_value(&self.metadata).unwrap_or_default()
    }

    fn summary(&self) -> &str {
        &self.summary
    }
}

/// Metadata borrowed from a sub-identifier; carries no summary since the
/// description belongs to the sub-identifier, not to the aggregate.
struct BorrowedEnricher<'a>(&'a Metadata);

impl MetadataEnricher for BorrowedEnricher<'_> {
    fn metadata(&self) -> serde_json::Value {
        serde_json::to_value(self.0).unwrap_or_default()
    }

    fn summary(&self) -> &str {
        ""
    }
}

/// NVD metadata appender.
#[derive(Default)]
pub struct NvdAppender {
    feed: Option<FeedSynchronizer>,
    index: Option<HashMap<String, NvdEnricher>>,
}

impl NvdAppender {
    pub const NAME: &'static str = "NVD";

    /// Subdirectory of the dump directory holding the feed documents.
    pub const DUMP_SUBDIR: &'static str = "nvd";

    /// Creates an appender that reads a pre-built dump.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an appender that downloads the feeds before indexing them.
    pub fn with_feed(feed: FeedSynchronizer) -> Self {
        Self {
            feed: Some(feed),
            index: None,
        }
    }

    /// Number of indexed CVEs, zero when the cache isn't built.
    pub fn len(&self) -> usize {
        self.index.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the sub-identifier with the highest score. A non-zero CVSS v3
    /// score is preferred over the v2 score of the same entry.
    fn highest_cvss_metadata<'a>(
        index: &'a HashMap<String, NvdEnricher>,
        ids: &[String],
    ) -> Option<&'a Metadata> {
        let mut max_score = 0.0;
        let mut max_metadata = None;

        for id in ids {
            let Some(enricher) = index.get(id) else {
                continue;
            };
            let metadata = &enricher.metadata;
            if metadata.cvss_v3.score != 0.0 && metadata.cvss_v3.score > max_score {
                max_score = metadata.cvss_v3.score;
                max_metadata = Some(metadata);
            } else if metadata.cvss_v2.score > max_score {
                max_score = metadata.cvss_v2.score;
                max_metadata = Some(metadata);
            }
        }

        max_metadata
    }
}

#[async_trait]
impl Appender for NvdAppender {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn state(&self) -> AppenderState {
        if self.index.is_some() {
            AppenderState::CacheBuilt
        } else {
            AppenderState::Idle
        }
    }

    async fn build_cache(&mut self, dump_dir: &Path) -> Result<()> {
        self.index = None;
        let dir = dump_dir.join(Self::DUMP_SUBDIR);

        let files = match &self.feed {
            Some(feed) => feed.sync(&dir).await?.files,
            None => {
                let listed = dir.clone();
                tokio::task::spawn_blocking(move || list_json_files(&listed))
                    .await
                    .map_err(|e| Error::io(&dir, std::io::Error::other(e)))??
            }
        };

        let index = tokio::task::spawn_blocking(move || load_index(&files))
            .await
            .map_err(|e| Error::io(&dir, std::io::Error::other(e)))??;

        info!(entries = index.len(), dir = %dir.display(), "built NVD metadata cache");
        self.index = Some(index);
        Ok(())
    }

    fn append(&self, name: &str, sub_ids: &[String], callback: &mut AppendFn<'_>) -> Result<()> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| Error::NotBuilt(Self::NAME.to_string()))?;

        if let Some(enricher) = index.get(name) {
            callback(Self::NAME, enricher, severity_from_cvss(&enricher.metadata));
            return Ok(());
        }

        if let Some(metadata) = Self::highest_cvss_metadata(index, sub_ids) {
            debug!(cve = name, "using highest scoring sub-identifier metadata");
            callback(
                Self::NAME,
                &BorrowedEnricher(metadata),
                severity_from_cvss(metadata),
            );
        }

        Ok(())
    }

    fn purge_cache(&mut self) {
        self.index = None;
    }
}

/// Lists `*.json` files directly inside `dir`, sorted by name.
fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::io(dir, e.into()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "json") {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Builds the index from feed documents. Any unreadable or malformed file
/// fails the whole build.
fn load_index(files: &[PathBuf]) -> Result<HashMap<String, NvdEnricher>> {
    let mut index = HashMap::new();

    for path in files {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let feed: types::NvdFeed =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let before = index.len();
        for entry in feed.entries {
            if let Some(metadata) = entry.metadata() {
                index.insert(
                    entry.id().to_string(),
                    NvdEnricher {
                        summary: entry.summary(),
                        metadata,
                    },
                );
            }
        }
        debug!(path = %path.display(), added = index.len() - before, "parsed NVD feed");
    }

    Ok(index)
}
