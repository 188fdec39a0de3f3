use serde::{Deserialize, Serialize};

/// Qualitative severity band.
///
/// Variants are declared from least to most severe so that `Ord` can be
/// used for threshold filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Negligible => "negligible",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata attached to a vulnerability by one appender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    /// Name of the appender that produced this record, e.g. `NVD`.
    pub source: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub summary: String,
    pub metadata: serde_json::Value,
}

/// A vulnerability matched against a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub package: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_by: Option<String>,
    /// Highest severity reported by any enrichment, `Unknown` when none matched.
    pub severity: Severity,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub enrichments: Vec<Enrichment>,
}

impl Vulnerability {
    /// Records an enrichment and raises the overall severity if needed.
    pub fn add_enrichment(&mut self, enrichment: Enrichment) {
        if enrichment.severity > self.severity {
            self.severity = enrichment.severity;
        }
        self.enrichments.push(enrichment);
    }
}
