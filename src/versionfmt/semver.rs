use super::{compare_sentinels, Parser};
use crate::error::{Error, Result};
use ::semver::Version;
use std::cmp::Ordering;

/// Semantic versions, as used by npm and Cargo.
///
/// A leading `v` is accepted, so `v1.2.3` equals `1.2.3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemverParser;

impl SemverParser {
    pub const NAME: &'static str = "semver";

    fn parse(version: &str) -> Result<Version> {
        Version::parse(version.trim_start_matches('v')).map_err(|_| Error::InvalidVersion {
            format: Self::NAME.to_string(),
            version: version.to_string(),
        })
    }
}

impl Parser for SemverParser {
    fn valid(&self, version: &str) -> bool {
        compare_sentinels(version, version).is_some() || Self::parse(version).is_ok()
    }

    fn compare(&self, a: &str, b: &str) -> Result<Ordering> {
        if let Some(ordering) = compare_sentinels(a, b) {
            return Ok(ordering);
        }
        Ok(Self::parse(a)?.cmp(&Self::parse(b)?))
    }

    fn namespaces(&self) -> Vec<String> {
        vec!["npm".to_string(), "cargo".to_string()]
    }
}
