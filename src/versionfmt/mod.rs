//! Version formats used to order package versions.
//!
//! Every package ecosystem has its own version grammar. A [`Parser`]
//! validates and compares versions of one grammar and declares which
//! namespaces (distributions, language ecosystems) use it. Parsers are
//! registered by format name in a [`ParserRegistry`], which also maintains
//! the namespace → format index.
//!
//! Two sentinel versions, [`MIN_VERSION`] and [`MAX_VERSION`], sort before
//! and after every real version of every format. They let a vulnerable
//! range be open-ended ("everything before 1.2.3") without special-casing
//! the comparison logic.

mod dpkg;
mod semver;

pub use self::dpkg::DpkgParser;
pub use self::semver::SemverParser;

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// A version that is always sorted first.
pub const MIN_VERSION: &str = "#MINV#";

/// A version that is always sorted last.
pub const MAX_VERSION: &str = "#MAXV#";

/// A version grammar that can validate and order version strings.
pub trait Parser: Send + Sync {
    /// Returns true if `version` conforms to this grammar.
    ///
    /// The sentinels are always valid.
    fn valid(&self, version: &str) -> bool;

    /// Orders two versions, including the sentinels.
    fn compare(&self, a: &str, b: &str) -> Result<Ordering>;

    /// Namespaces whose packages are versioned with this grammar.
    fn namespaces(&self) -> Vec<String>;
}

/// Orders `a` and `b` if either of them is a sentinel.
///
/// Returns `None` when neither is, leaving the comparison to the parser.
pub fn compare_sentinels(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return match a {
            MIN_VERSION | MAX_VERSION => Some(Ordering::Equal),
            _ => None,
        };
    }
    match (a, b) {
        (MIN_VERSION, _) | (_, MAX_VERSION) => Some(Ordering::Less),
        (MAX_VERSION, _) | (_, MIN_VERSION) => Some(Ordering::Greater),
        _ => None,
    }
}

#[derive(Default)]
struct Registered {
    parsers: HashMap<String, Arc<dyn Parser>>,
    namespaces: HashMap<String, String>,
}

/// Name-keyed table of version parsers plus the namespace → format index.
#[derive(Default)]
pub struct ParserRegistry {
    inner: RwLock<Registered>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a parser available under `name` and indexes its namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is blank, already registered,
    /// or one of the parser's namespaces already belongs to another format.
    /// Nothing is registered when an error is returned.
    pub fn register(&self, name: &str, parser: Arc<dyn Parser>) -> Result<()> {
        self.register_opt(name, Some(parser))
    }

    /// Like [`register`](Self::register), for parsers resolved at runtime
    /// that may be missing.
    pub fn register_opt(&self, name: &str, parser: Option<Arc<dyn Parser>>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config(
                "could not register a version parser with an empty name".to_string(),
            ));
        }
        let parser = parser.ok_or_else(|| {
            Error::Config(format!("could not register a missing version parser for {}", name))
        })?;

        let name = name.to_lowercase();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.parsers.contains_key(&name) {
            return Err(Error::Config(format!(
                "version parser registered twice for {}",
                name
            )));
        }

        let namespaces: Vec<String> = parser
            .namespaces()
            .into_iter()
            .map(|ns| ns.to_lowercase())
            .collect();
        for (i, namespace) in namespaces.iter().enumerate() {
            if inner.namespaces.contains_key(namespace) || namespaces[..i].contains(namespace) {
                return Err(Error::Config(format!(
                    "namespace {} already associated with a version format",
                    namespace
                )));
            }
        }

        for namespace in namespaces {
            inner.namespaces.insert(namespace, name.clone());
        }
        debug!(format = %name, "registered version parser");
        inner.parsers.insert(name, parser);
        Ok(())
    }

    /// Returns the parser registered under `name`, ignoring case.
    pub fn parser(&self, name: &str) -> Option<Arc<dyn Parser>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .parsers
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Registered format names, sorted.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = inner.parsers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Checks `version` against `format`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownFormat`] if no parser is registered for `format`,
    /// [`Error::InvalidVersion`] if the version doesn't validate.
    pub fn valid(&self, format: &str, version: &str) -> Result<()> {
        let parser = self
            .parser(format)
            .ok_or_else(|| Error::UnknownFormat(format.to_string()))?;

        if !parser.valid(version) {
            return Err(Error::InvalidVersion {
                format: format.to_string(),
                version: version.to_string(),
            });
        }
        Ok(())
    }

    /// Compares two versions with the parser registered for `format`.
    pub fn compare(&self, format: &str, a: &str, b: &str) -> Result<Ordering> {
        let parser = self
            .parser(format)
            .ok_or_else(|| Error::UnknownFormat(format.to_string()))?;
        parser.compare(a, b)
    }

    /// Returns the higher of `a` and `b`.
    ///
    /// An empty version counts as absent and loses to any other version;
    /// two empty versions give an empty result. When the comparison fails,
    /// `b` is returned together with the error.
    pub fn higher_version(&self, format: &str, a: &str, b: &str) -> (String, Option<Error>) {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return (String::new(), None),
            (true, false) => return (b.to_string(), None),
            (false, true) => return (a.to_string(), None),
            (false, false) => {}
        }

        match self.compare(format, a, b) {
            Ok(Ordering::Less) => (b.to_string(), None),
            Ok(_) => (a.to_string(), None),
            Err(e) => (b.to_string(), Some(e)),
        }
    }

    /// Returns the format used by `namespace`.
    ///
    /// Anything from the first `:` onward is ignored, so `rhel:8` resolves
    /// to the format registered for `rhel`. Lookups ignore case.
    pub fn format_for_namespace(&self, namespace: &str) -> Option<String> {
        let distro = namespace.split(':').next().unwrap_or_default();
        let key = if distro.is_empty() { namespace } else { distro };

        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .namespaces
            .get(&key.to_lowercase())
            .cloned()
    }
}

/// Builds the registry with every parser shipped in this crate.
pub fn default_registry() -> Result<ParserRegistry> {
    let registry = ParserRegistry::new();
    registry.register(DpkgParser::NAME, Arc::new(DpkgParser))?;
    registry.register(SemverParser::NAME, Arc::new(SemverParser))?;
    Ok(registry)
}
