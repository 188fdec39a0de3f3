use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Dpkg,
    Rpm,
    Apk,
    Python,
    Npm,
    Cargo,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Dpkg => "dpkg",
            SourceType::Rpm => "rpm",
            SourceType::Apk => "apk",
            SourceType::Python => "python",
            SourceType::Npm => "npm",
            SourceType::Cargo => "cargo",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceType::Dpkg => "Debian package",
            SourceType::Rpm => "RPM package",
            SourceType::Apk => "Alpine package",
            SourceType::Python => "Python distribution",
            SourceType::Npm => "NPM package",
            SourceType::Cargo => "Cargo crate",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A package found in an image layer or on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    pub source_type: SourceType,
    /// Namespace used to pick the version format, e.g. `debian:12`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Path of the manifest the component was read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Component {
    pub fn new(name: impl Into<String>, version: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            source_type,
            namespace: None,
            location: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}
