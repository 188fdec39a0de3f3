//! Python core metadata (`METADATA`, `PKG-INFO`).
//!
//! See <https://packaging.python.org/specifications/core-metadata/>.

use crate::model::{Component, SourceType};

/// Path suffixes of Python distribution metadata files.
pub const METADATA_SUFFIXES: &[&str] = &[".dist-info/METADATA", ".egg-info/PKG-INFO"];

pub fn is_metadata_path(path: &str) -> bool {
    METADATA_SUFFIXES.iter().any(|s| path.ends_with(s))
}

/// Reads the `Name` and `Version` fields of a core metadata file.
///
/// The file may be an unrelated file that happens to have a matching name,
/// in which case `None` is returned. A component is returned as soon as
/// either field is present; scanning stops once both are found.
pub fn parse_metadata_file(path: &str, contents: &str) -> Option<Component> {
    let mut component: Option<Component> = None;

    for line in contents.lines() {
        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => continue,
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }

        let c = match key {
            "Name" | "Version" => component.get_or_insert_with(|| {
                Component::new("", "", SourceType::Python).with_location(path)
            }),
            _ => continue,
        };
        if key == "Name" {
            c.name = value.to_string();
        } else {
            c.version = value.to_string();
        }

        if !c.name.is_empty() && !c.version.is_empty() {
            break;
        }
    }

    component
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "usr/lib/python3/dist-packages/requests-2.31.0.dist-info/METADATA";

    #[test]
    fn test_parse_metadata_file() {
        let contents = "Metadata-Version: 2.1\nName: requests\nVersion: 2.31.0\nSummary: Python HTTP for Humans.\n";
        let component = parse_metadata_file(PATH, contents).unwrap();
        assert_eq!(component.name, "requests");
        assert_eq!(component.version, "2.31.0");
        assert_eq!(component.source_type, SourceType::Python);
        assert_eq!(component.location.as_deref(), Some(PATH));
    }

    #[test]
    fn test_first_value_wins_after_both_found() {
        let contents = "Name: six\nVersion: 1.16.0\nName: other\n";
        let component = parse_metadata_file(PATH, contents).unwrap();
        assert_eq!(component.name, "six");
    }

    #[test]
    fn test_partial_metadata() {
        let component = parse_metadata_file(PATH, "Name: incomplete\n").unwrap();
        assert_eq!(component.name, "incomplete");
        assert!(component.version.is_empty());
    }

    #[test]
    fn test_unrelated_file() {
        assert!(parse_metadata_file(PATH, "just some text\nkey_without_value:\n").is_none());
        assert!(parse_metadata_file(PATH, "").is_none());
    }

    #[test]
    fn test_is_metadata_path() {
        assert!(is_metadata_path(PATH));
        assert!(is_metadata_path("usr/lib/python3.11/site-packages/foo.egg-info/PKG-INFO"));
        assert!(!is_metadata_path("usr/lib/python3/dist-packages/foo/METADATA.txt"));
    }
}
