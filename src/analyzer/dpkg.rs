use crate::model::{Component, SourceType};

/// Location of the dpkg database inside a root filesystem.
pub const STATUS_PATH: &str = "var/lib/dpkg/status";

#[derive(Default)]
struct Stanza<'a> {
    package: Option<&'a str>,
    version: Option<&'a str>,
    status: Option<&'a str>,
}

impl Stanza<'_> {
    fn into_component(self) -> Option<Component> {
        let installed = self
            .status
            .is_some_and(|s| s.split_whitespace().last() == Some("installed"));
        if !installed {
            return None;
        }
        Some(
            Component::new(self.package?, self.version?, SourceType::Dpkg)
                .with_location(STATUS_PATH),
        )
    }
}

/// Parses a dpkg `status` file, keeping only installed packages.
///
/// Stanzas missing a package name or version are skipped.
pub fn parse_status(contents: &str) -> Vec<Component> {
    let mut components = Vec::new();
    let mut stanza = Stanza::default();

    for line in contents.lines() {
        if line.trim().is_empty() {
            components.extend(std::mem::take(&mut stanza).into_component());
            continue;
        }
        // Continuation of a multi-line field such as Description.
        if line.starts_with([' ', '\t']) {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Package" => stanza.package = Some(value),
            "Version" => stanza.version = Some(value),
            "Status" => stanza.status = Some(value),
            _ => {}
        }
    }
    components.extend(stanza.into_component());

    components
}
