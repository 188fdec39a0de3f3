//! Image format extractors.
//!
//! An [`Extractor`] pulls the files selected by a [`FileMatcher`] out of a
//! single image layer. Extractors are registered by format name in an
//! [`ExtractorRegistry`] that is built once at startup and shared by every
//! request afterwards.
//!
//! | Format | Extractor |
//! |--------|-----------|
//! | `docker` | [`TarExtractor`] (plain or gzip-compressed tar) |
//!
//! # Example
//!
//! ```no_run
//! use layerscan::imagefmt::{default_registry, PrefixMatcher};
//! use std::fs::File;
//!
//! # fn main() -> layerscan::Result<()> {
//! let registry = default_registry(64 * 1024 * 1024)?;
//! let layer = File::open("layer.tar.gz").unwrap();
//! let matcher = PrefixMatcher::new(["var/lib/dpkg/status"]);
//!
//! let files = registry.extract_from_reader(layer, "Docker", &matcher)?;
//! println!("Extracted {} files", files.len());
//! # Ok(())
//! # }
//! ```

mod docker;

pub use docker::TarExtractor;

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Selects which paths inside a layer are worth extracting.
pub trait FileMatcher: Send + Sync {
    fn matches(&self, path: &str) -> bool;
}

impl<F> FileMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, path: &str) -> bool {
        self(path)
    }
}

/// Matches any of the given paths exactly.
#[derive(Debug, Clone)]
pub struct ExactMatcher {
    paths: Vec<String>,
}

impl ExactMatcher {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl FileMatcher for ExactMatcher {
    fn matches(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

/// Matches paths starting with any of the given prefixes.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefixes: Vec<String>,
}

impl PrefixMatcher {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl FileMatcher for PrefixMatcher {
    fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Matches paths ending with any of the given suffixes.
#[derive(Debug, Clone)]
pub struct SuffixMatcher {
    suffixes: Vec<String>,
}

impl SuffixMatcher {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl FileMatcher for SuffixMatcher {
    fn matches(&self, path: &str) -> bool {
        self.suffixes.iter().any(|s| path.ends_with(s.as_str()))
    }
}

/// Matches when any of the inner matchers does.
pub struct AnyMatcher {
    matchers: Vec<Box<dyn FileMatcher>>,
}

impl AnyMatcher {
    pub fn new(matchers: Vec<Box<dyn FileMatcher>>) -> Self {
        Self { matchers }
    }
}

impl FileMatcher for AnyMatcher {
    fn matches(&self, path: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(path))
    }
}

/// Files pulled out of a layer, keyed by their path inside the layer.
///
/// Paths are stored without a leading `./` or `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerFiles {
    files: BTreeMap<String, Vec<u8>>,
}

impl LayerFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: Vec<u8>) {
        self.files.insert(path.into(), contents);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Extracts files from one image format.
pub trait Extractor: Send + Sync {
    /// Reads `layer` and returns every regular file accepted by `matcher`.
    fn extract_files(&self, layer: &mut dyn Read, matcher: &dyn FileMatcher) -> Result<LayerFiles>;
}

/// Name-keyed table of extractors.
///
/// Names are stored lowercase. Lookups take a shared lock so that requests
/// can dispatch concurrently; registration takes the exclusive lock.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: RwLock<HashMap<String, Arc<dyn Extractor>>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an extractor available under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is blank or already registered.
    /// Callers must treat this as fatal: it means the process was wired up
    /// inconsistently.
    pub fn register(&self, name: &str, extractor: Arc<dyn Extractor>) -> Result<()> {
        self.register_opt(name, Some(extractor))
    }

    /// Like [`register`](Self::register), for extractors resolved at runtime
    /// that may be missing.
    pub fn register_opt(&self, name: &str, extractor: Option<Arc<dyn Extractor>>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config(
                "could not register an extractor with an empty name".to_string(),
            ));
        }
        let extractor = extractor.ok_or_else(|| {
            Error::Config(format!("could not register a missing extractor for {}", name))
        })?;

        let name = name.to_lowercase();
        let mut extractors = self.extractors.write().unwrap_or_else(PoisonError::into_inner);
        if extractors.contains_key(&name) {
            return Err(Error::Config(format!(
                "extractor registered twice for {}",
                name
            )));
        }

        debug!(format = %name, "registered image extractor");
        extractors.insert(name, extractor);
        Ok(())
    }

    /// Returns the extractor for `name`, ignoring case.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Returns a copy of the registered extractors.
    ///
    /// Changes to the returned map don't affect the registry.
    pub fn extractors(&self) -> HashMap<String, Arc<dyn Extractor>> {
        self.extractors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered format names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .extractors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Extracts files from `reader` using the extractor registered for `format`.
    ///
    /// The reader is consumed and dropped before returning, whether or not
    /// extraction succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] if no extractor handles `format`, or the
    /// extractor's own error if reading the layer fails.
    pub fn extract_from_reader<R: Read>(
        &self,
        mut reader: R,
        format: &str,
        matcher: &dyn FileMatcher,
    ) -> Result<LayerFiles> {
        let extractor = self
            .lookup(format)
            .ok_or_else(|| Error::BadRequest(format!("unsupported image format {:?}", format)))?;

        extractor.extract_files(&mut reader, matcher)
    }
}

/// Builds the registry with every extractor shipped in this crate.
pub fn default_registry(max_file_size: u64) -> Result<ExtractorRegistry> {
    let registry = ExtractorRegistry::new();
    registry.register("Docker", Arc::new(TarExtractor::new(max_file_size)))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedExtractor;

    impl Extractor for FixedExtractor {
        fn extract_files(&self, layer: &mut dyn Read, _matcher: &dyn FileMatcher) -> Result<LayerFiles> {
            let mut buf = Vec::new();
            layer
                .read_to_end(&mut buf)
                .map_err(|e| Error::Extraction(e.to_string()))?;
            let mut files = LayerFiles::new();
            files.insert("layer", buf);
            Ok(files)
        }
    }

    struct FailingExtractor;

    impl Extractor for FailingExtractor {
        fn extract_files(&self, _layer: &mut dyn Read, _matcher: &dyn FileMatcher) -> Result<LayerFiles> {
            Err(Error::Extraction("corrupt layer".to_string()))
        }
    }

    struct TrackedReader {
        inner: Cursor<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl Read for TrackedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Drop for TrackedReader {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn tracked(data: &[u8]) -> (TrackedReader, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let reader = TrackedReader {
            inner: Cursor::new(data.to_vec()),
            closed: closed.clone(),
        };
        (reader, closed)
    }

    #[test]
    fn test_register_and_lookup_case_insensitive() {
        let registry = ExtractorRegistry::new();
        let extractor: Arc<dyn Extractor> = Arc::new(FixedExtractor);
        registry.register("Docker", extractor.clone()).unwrap();

        let found = registry.lookup("DOCKER").unwrap();
        assert!(Arc::ptr_eq(&found, &extractor));
        assert!(registry.lookup("oci").is_none());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ExtractorRegistry::new();
        registry.register("docker", Arc::new(FixedExtractor)).unwrap();
        let err = registry.register("DOCKER", Arc::new(FixedExtractor)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let registry = ExtractorRegistry::new();
        let err = registry.register("", Arc::new(FixedExtractor)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_register_rejects_missing_extractor() {
        let registry = ExtractorRegistry::new();
        let err = registry.register_opt("docker", None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(registry.lookup("docker").is_none());
    }

    #[test]
    fn test_extractors_returns_snapshot() {
        let registry = ExtractorRegistry::new();
        registry.register("docker", Arc::new(FixedExtractor)).unwrap();

        let mut snapshot = registry.extractors();
        snapshot.clear();

        assert!(registry.lookup("docker").is_some());
        assert_eq!(registry.names(), vec!["docker".to_string()]);
    }

    #[test]
    fn test_extract_closes_reader_on_success() {
        let registry = ExtractorRegistry::new();
        registry.register("docker", Arc::new(FixedExtractor)).unwrap();

        let (reader, closed) = tracked(b"payload");
        let files = registry
            .extract_from_reader(reader, "docker", &|_: &str| true)
            .unwrap();

        assert_eq!(files.get("layer"), Some(&b"payload"[..]));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_extract_closes_reader_on_failure() {
        let registry = ExtractorRegistry::new();
        registry.register("docker", Arc::new(FailingExtractor)).unwrap();

        let (reader, closed) = tracked(b"payload");
        let err = registry
            .extract_from_reader(reader, "docker", &|_: &str| true)
            .unwrap_err();

        assert!(matches!(err, Error::Extraction(_)));
        assert!(!err.is_client_error());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_extract_unknown_format_is_bad_request() {
        let registry = ExtractorRegistry::new();

        let (reader, closed) = tracked(b"payload");
        let err = registry
            .extract_from_reader(reader, "appc", &|_: &str| true)
            .unwrap_err();

        assert!(matches!(err, Error::BadRequest(_)));
        assert!(err.is_client_error());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_matchers() {
        let prefix = PrefixMatcher::new(["var/lib/dpkg/"]);
        assert!(prefix.matches("var/lib/dpkg/status"));
        assert!(!prefix.matches("usr/lib/os-release"));

        let suffix = SuffixMatcher::new(["METADATA", "PKG-INFO"]);
        assert!(suffix.matches("usr/lib/python3/site-packages/requests-2.31.0.dist-info/METADATA"));
        assert!(!suffix.matches("etc/passwd"));

        let exact = ExactMatcher::new(["etc/os-release"]);
        assert!(exact.matches("etc/os-release"));
        assert!(!exact.matches("etc/os-release.bak"));
        assert!(!exact.matches("etc/os-releas"));

        let any = AnyMatcher::new(vec![Box::new(prefix), Box::new(suffix)]);
        assert!(any.matches("var/lib/dpkg/status"));
        assert!(any.matches("x/PKG-INFO"));
        assert!(!any.matches("etc/hosts"));
    }

    #[test]
    fn test_default_registry_has_docker() {
        let registry = default_registry(1024).unwrap();
        assert!(registry.lookup("docker").is_some());
    }
}
