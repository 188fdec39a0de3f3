//! Wire types for the NVD JSON 1.1 data feeds.

use super::{CvssV2, CvssV3, Metadata};
use serde::Deserialize;

#[derive(Deserialize)]
pub(super) struct NvdFeed {
    #[serde(rename = "CVE_Items", default)]
    pub entries: Vec<NvdEntry>,
}

#[derive(Deserialize)]
pub(super) struct NvdEntry {
    cve: NvdCve,
    #[serde(default)]
    impact: NvdImpact,
    #[serde(rename = "publishedDate", default)]
    published_date: String,
    #[serde(rename = "lastModifiedDate", default)]
    last_modified_date: String,
}

#[derive(Deserialize)]
struct NvdCve {
    #[serde(rename = "CVE_data_meta")]
    meta: NvdCveMeta,
    #[serde(default)]
    description: NvdDescription,
}

#[derive(Deserialize)]
struct NvdCveMeta {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize, Default)]
struct NvdDescription {
    #[serde(rename = "description_data", default)]
    data: Vec<NvdLangString>,
}

#[derive(Deserialize)]
struct NvdLangString {
    #[serde(default)]
    lang: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize, Default)]
struct NvdImpact {
    #[serde(rename = "baseMetricV2")]
    v2: Option<NvdBaseMetricV2>,
    #[serde(rename = "baseMetricV3")]
    v3: Option<NvdBaseMetricV3>,
}

#[derive(Deserialize)]
struct NvdBaseMetricV2 {
    #[serde(rename = "cvssV2")]
    cvss: NvdCvss,
    #[serde(rename = "exploitabilityScore", default)]
    exploitability_score: f64,
    #[serde(rename = "impactScore", default)]
    impact_score: f64,
}

#[derive(Deserialize)]
struct NvdBaseMetricV3 {
    #[serde(rename = "cvssV3")]
    cvss: NvdCvss,
    #[serde(rename = "exploitabilityScore", default)]
    exploitability_score: f64,
    #[serde(rename = "impactScore", default)]
    impact_score: f64,
}

#[derive(Deserialize)]
struct NvdCvss {
    #[serde(rename = "vectorString", default)]
    vector_string: String,
    #[serde(rename = "baseScore", default)]
    base_score: f64,
}

impl NvdEntry {
    pub fn id(&self) -> &str {
        &self.cve.meta.id
    }

    /// English description, or the first one if none is marked English.
    pub fn summary(&self) -> String {
        let data = &self.cve.description.data;
        data.iter()
            .find(|d| d.lang == "en")
            .or_else(|| data.first())
            .map(|d| d.value.clone())
            .unwrap_or_default()
    }

    /// Returns `None` when the entry carries no CVSS vector at all.
    pub fn metadata(&self) -> Option<Metadata> {
        let v2 = self.impact.v2.as_ref();
        let v3 = self.impact.v3.as_ref();

        let has_v2 = v2.is_some_and(|m| !m.cvss.vector_string.is_empty());
        let has_v3 = v3.is_some_and(|m| !m.cvss.vector_string.is_empty());
        if !has_v2 && !has_v3 {
            return None;
        }

        Some(Metadata {
            published_date_time: self.published_date.clone(),
            last_modified_date_time: self.last_modified_date.clone(),
            cvss_v2: v2
                .map(|m| CvssV2 {
                    vectors: m.cvss.vector_string.clone(),
                    score: m.cvss.base_score,
                    exploitability_score: m.exploitability_score,
                    impact_score: m.impact_score,
                })
                .unwrap_or_default(),
            cvss_v3: v3
                .map(|m| CvssV3 {
                    vectors: m.cvss.vector_string.clone(),
                    score: m.cvss.base_score,
                    exploitability_score: m.exploitability_score,
                    impact_score: m.impact_score,
                })
                .unwrap_or_default(),
        })
    }
}
