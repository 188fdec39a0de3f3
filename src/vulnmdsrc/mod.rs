//! Vulnerability metadata sources.
//!
//! An [`Appender`] loads metadata (scores, dates, descriptions) for
//! vulnerability identifiers and attaches it to matched vulnerabilities.
//! Each appender has an explicit lifecycle:
//!
//! 1. [`build_cache`](Appender::build_cache) loads the metadata into an
//!    in-memory index
//! 2. [`append`](Appender::append) serves lookups from that index; any number
//!    of lookups may run concurrently since the index is never mutated
//! 3. [`purge_cache`](Appender::purge_cache) releases the index
//!
//! `build_cache` and `purge_cache` take `&mut self`, so they cannot overlap
//! with in-flight lookups.
//!
//! | Appender | Source |
//! |----------|--------|
//! | [`NvdAppender`] | NIST NVD JSON 1.1 feeds |

pub mod nvd;

pub use nvd::NvdAppender;

use crate::error::{Error, Result};
use crate::model::{Enrichment, Severity};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

/// Metadata found for one vulnerability.
pub trait MetadataEnricher: Send + Sync {
    /// The structured metadata, as JSON.
    fn metadata(&self) -> serde_json::Value;

    /// Short human-readable description, may be empty.
    fn summary(&self) -> &str;
}

/// Callback invoked by [`Appender::append`] for every metadata match:
/// `(appender name, metadata, severity)`.
pub type AppendFn<'a> = dyn FnMut(&str, &dyn MetadataEnricher, Severity) + 'a;

/// Lifecycle state of an appender's in-memory index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppenderState {
    Idle,
    CacheBuilt,
}

/// A source of vulnerability metadata.
#[async_trait]
pub trait Appender: Send + Sync {
    /// Returns the name of this appender, e.g. `NVD`.
    fn name(&self) -> &str;

    /// Returns whether the index is currently loaded.
    fn state(&self) -> AppenderState;

    /// Loads metadata from `dump_dir` into memory.
    ///
    /// On error no index is kept; a partially loaded index is never served.
    async fn build_cache(&mut self, dump_dir: &Path) -> Result<()>;

    /// Looks up metadata for `name`, falling back to `sub_ids` when the
    /// vulnerability aggregates several identifiers.
    ///
    /// Missing metadata is not an error: the callback is simply not invoked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBuilt`] if called before `build_cache`.
    fn append(&self, name: &str, sub_ids: &[String], callback: &mut AppendFn<'_>) -> Result<()>;

    /// Releases the index built by `build_cache`.
    fn purge_cache(&mut self);
}

/// Ordered, name-keyed set of appenders driven through their lifecycle
/// together.
#[derive(Default)]
pub struct AppenderRegistry {
    appenders: Vec<(String, Box<dyn Appender>)>,
}

impl AppenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an appender under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is blank or already taken.
    pub fn register(&mut self, name: &str, appender: Box<dyn Appender>) -> Result<()> {
        self.register_opt(name, Some(appender))
    }

    /// Like [`register`](Self::register), for appenders resolved at runtime
    /// that may be missing.
    pub fn register_opt(&mut self, name: &str, appender: Option<Box<dyn Appender>>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config(
                "could not register an appender with an empty name".to_string(),
            ));
        }
        let appender = appender.ok_or_else(|| {
            Error::Config(format!("could not register a missing appender for {}", name))
        })?;
        if self.appenders.iter().any(|(n, _)| n == name) {
            return Err(Error::Config(format!("appender registered twice for {}", name)));
        }

        debug!(appender = name, "registered metadata appender");
        self.appenders.push((name.to_string(), appender));
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.appenders.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.appenders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appenders.is_empty()
    }

    /// Builds every appender's cache. Stops at the first failure.
    pub async fn build_all(&mut self, dump_dir: &Path) -> Result<()> {
        for (name, appender) in &mut self.appenders {
            info!(appender = %name, dump_dir = %dump_dir.display(), "building metadata cache");
            appender.build_cache(dump_dir).await?;
        }
        Ok(())
    }

    /// Collects enrichments for `id` from every appender.
    pub fn enrich(&self, id: &str, sub_ids: &[String]) -> Result<Vec<Enrichment>> {
        let mut enrichments = Vec::new();
        for (_, appender) in &self.appenders {
            appender.append(id, sub_ids, &mut |source, enricher, severity| {
                enrichments.push(Enrichment {
                    source: source.to_string(),
                    severity,
                    summary: enricher.summary().to_string(),
                    metadata: enricher.metadata(),
                });
            })?;
        }
        Ok(enrichments)
    }

    /// Releases every appender's cache.
    pub fn purge_all(&mut self) {
        for (name, appender) in &mut self.appenders {
            debug!(appender = %name, "purging metadata cache");
            appender.purge_cache();
        }
    }
}
