//! Matching components against vulnerability definitions.
//!
//! A [`VulnDefinition`] marks versions of a package in a namespace as
//! affected when `introduced <= version < fixed_by`. The version format is
//! resolved from the namespace through the [`ParserRegistry`];
//! [`MIN_VERSION`] and [`MAX_VERSION`] stand for "since forever" and "not
//! fixed yet". Matches are enriched by every appender of an
//! [`AppenderRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use layerscan::matcher::{VulnDefinition, VulnMatcher};
//! use layerscan::model::{Component, SourceType};
//! use layerscan::versionfmt;
//! use layerscan::vulnmdsrc::AppenderRegistry;
//!
//! # fn main() -> layerscan::Result<()> {
//! let parsers = versionfmt::default_registry()?;
//! let appenders = AppenderRegistry::new();
//! let definitions = VulnMatcher::load_definitions("definitions.json".as_ref())?;
//!
//! let matcher = VulnMatcher::new(&parsers, &appenders, definitions);
//! let component = Component::new("openssl", "3.0.2-0ubuntu1", SourceType::Dpkg)
//!     .with_namespace("ubuntu:22.04");
//! for vuln in matcher.match_components(&[component])? {
//!     println!("{} {}", vuln.id, vuln.severity);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::model::{Component, Severity, Vulnerability};
use crate::versionfmt::{ParserRegistry, MAX_VERSION, MIN_VERSION};
use crate::vulnmdsrc::AppenderRegistry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

fn min_version() -> String {
    MIN_VERSION.to_string()
}

fn max_version() -> String {
    MAX_VERSION.to_string()
}

/// An affected version range of one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnDefinition {
    pub id: String,
    /// Namespace of the affected package, e.g. `debian:12` or `npm`.
    pub namespace: String,
    pub package: String,
    /// First affected version.
    #[serde(default = "min_version")]
    pub introduced: String,
    /// First fixed version.
    #[serde(default = "max_version")]
    pub fixed_by: String,
    /// Identifiers aggregated by `id`, e.g. the CVEs of an advisory.
    #[serde(default)]
    pub sub_ids: Vec<String>,
    /// Severity assigned by the definition's publisher.
    #[serde(default)]
    pub severity: Option<Severity>,
}

/// Matches components against a fixed set of definitions.
pub struct VulnMatcher<'a> {
    parsers: &'a ParserRegistry,
    appenders: &'a AppenderRegistry,
    definitions: HashMap<(String, String), Vec<VulnDefinition>>,
}

impl<'a> VulnMatcher<'a> {
    pub fn new(
        parsers: &'a ParserRegistry,
        appenders: &'a AppenderRegistry,
        definitions: Vec<VulnDefinition>,
    ) -> Self {
        let mut index: HashMap<(String, String), Vec<VulnDefinition>> = HashMap::new();
        for definition in definitions {
            index
                .entry((definition.namespace.to_lowercase(), definition.package.clone()))
                .or_default()
                .push(definition);
        }
        Self {
            parsers,
            appenders,
            definitions: index,
        }
    }

    /// Reads a JSON array of definitions.
    pub fn load_definitions(path: &Path) -> Result<Vec<VulnDefinition>> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| Error::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Returns whether `version` lies in the range of `definition`.
    pub fn affects(&self, format: &str, definition: &VulnDefinition, version: &str) -> Result<bool> {
        let after_introduced =
            self.parsers.compare(format, version, &definition.introduced)? != Ordering::Less;
        let before_fix = self.parsers.compare(format, version, &definition.fixed_by)? == Ordering::Less;
        Ok(after_introduced && before_fix)
    }

    /// Matches `components` and enriches every match.
    ///
    /// Components without a namespace, or whose namespace has no version
    /// format, are skipped. When several definitions of one identifier
    /// match a component, the highest fix version is reported.
    ///
    /// # Errors
    ///
    /// Fails if an appender's cache hasn't been built.
    pub fn match_components(&self, components: &[Component]) -> Result<Vec<Vulnerability>> {
        let mut matched: BTreeMap<(String, String, String), Vulnerability> = BTreeMap::new();
        let mut sub_ids: HashMap<String, Vec<String>> = HashMap::new();

        for component in components {
            let Some(namespace) = component.namespace.as_deref() else {
                continue;
            };
            let Some(format) = self.parsers.format_for_namespace(namespace) else {
                debug!(namespace, package = %component.name, "no version format for namespace");
                continue;
            };
            if let Err(e) = self.parsers.valid(&format, &component.version) {
                debug!(package = %component.name, error = %e, "skipping component");
                continue;
            }

            let key = (namespace.to_lowercase(), component.name.clone());
            for definition in self.definitions.get(&key).into_iter().flatten() {
                match self.affects(&format, definition, &component.version) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(id = %definition.id, package = %component.name, error = %e, "could not compare versions");
                        continue;
                    }
                }

                let fixed_by = if definition.fixed_by == MAX_VERSION {
                    String::new()
                } else {
                    definition.fixed_by.clone()
                };

                let entry_key = (
                    definition.id.clone(),
                    component.name.clone(),
                    component.version.clone(),
                );
                let vuln = matched.entry(entry_key).or_insert_with(|| Vulnerability {
                    id: definition.id.clone(),
                    package: component.name.clone(),
                    version: component.version.clone(),
                    namespace: component.namespace.clone(),
                    fixed_by: None,
                    severity: Severity::Unknown,
                    enrichments: Vec::new(),
                });

                let (higher, err) = self.parsers.higher_version(
                    &format,
                    vuln.fixed_by.as_deref().unwrap_or_default(),
                    &fixed_by,
                );
                if let Some(e) = err {
                    warn!(id = %definition.id, error = %e, "could not compare fix versions");
                }
                vuln.fixed_by = Some(higher).filter(|v| !v.is_empty());
                if let Some(severity) = definition.severity {
                    vuln.severity = vuln.severity.max(severity);
                }
                sub_ids
                    .entry(definition.id.clone())
                    .or_default()
                    .extend(definition.sub_ids.iter().cloned());
            }
        }

        let mut vulnerabilities = Vec::with_capacity(matched.len());
        for (_, mut vuln) in matched {
            let subs = sub_ids.get(&vuln.id).map(Vec::as_slice).unwrap_or_default();
            for enrichment in self.appenders.enrich(&vuln.id, subs)? {
                vuln.add_enrichment(enrichment);
            }
            vulnerabilities.push(vuln);
        }

        debug!(
            components = components.len(),
            vulnerabilities = vulnerabilities.len(),
            "matched components"
        );
        Ok(vulnerabilities)
    }
}
