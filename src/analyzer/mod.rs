//! Package manifest parsers.
//!
//! Each parser turns the contents of one manifest file into [`Component`]s.
//! Parsers never fail: a file that merely happens to have a matching name is
//! skipped.
//!
//! | Parser | Manifest |
//! |--------|----------|
//! | [`dpkg::parse_status`] | `var/lib/dpkg/status` |
//! | [`python::parse_metadata_file`] | `*.dist-info/METADATA`, `*.egg-info/PKG-INFO` |
//! | [`os_release::parse_namespace`] | `etc/os-release`, `usr/lib/os-release` |
//!
//! [`Component`]: crate::model::Component

pub mod dpkg;
pub mod os_release;
pub mod python;

use crate::imagefmt::{AnyMatcher, ExactMatcher, LayerFiles, SuffixMatcher};
use crate::model::Component;

/// Matches every manifest path understood by the parsers in this module.
pub fn manifest_matcher() -> AnyMatcher {
    AnyMatcher::new(vec![
        Box::new(ExactMatcher::new(
            [dpkg::STATUS_PATH]
                .into_iter()
                .chain(os_release::PATHS.iter().copied()),
        )),
        Box::new(SuffixMatcher::new(python::METADATA_SUFFIXES.iter().copied())),
    ])
}

/// Components found in a set of extracted files, with the OS namespace of
/// the files when one was found.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub namespace: Option<String>,
    pub components: Vec<Component>,
}

/// Runs every parser over `files`.
///
/// OS packages get the namespace read from `os-release`; language packages
/// keep the namespace of their ecosystem.
pub fn analyze(files: &LayerFiles) -> Analysis {
    let namespace = os_release::PATHS
        .iter()
        .find_map(|path| files.get(path))
        .and_then(|contents| os_release::parse_namespace(&String::from_utf8_lossy(contents)));

    let mut components = Vec::new();
    for (path, contents) in files.iter() {
        let contents = String::from_utf8_lossy(contents);
        if path == dpkg::STATUS_PATH {
            components.extend(dpkg::parse_status(&contents).into_iter().map(|c| match &namespace {
                Some(ns) => c.with_namespace(ns.clone()),
                None => c,
            }));
        } else if python::is_metadata_path(path) {
            components.extend(python::parse_metadata_file(path, &contents));
        }
    }

    Analysis {
        namespace,
        components,
    }
}
