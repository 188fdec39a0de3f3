use super::{InventoryScan, NodeInventorizer, Note};
use crate::analyzer::{dpkg, os_release, python};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directories searched for Python distribution metadata, relative to the
/// host root.
const PYTHON_ROOTS: &[&str] = &["usr/lib", "usr/local/lib"];

/// Inventories the packages installed on the host mounted at `root`.
///
/// Reads the dpkg database, `os-release`, and Python distribution metadata.
pub struct HostScanner {
    root: PathBuf,
}

impl HostScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reads `path`, mapping a missing file to `None`.
fn read_optional(path: &Path) -> std::result::Result<Option<String>, std::io::Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn scan_root(node: &str, root: &Path) -> Result<InventoryScan> {
    let failed = |path: &Path, e: std::io::Error| Error::Scan {
        node: node.to_string(),
        reason: format!("{}: {}", path.display(), e),
    };

    let mut scan = InventoryScan::default();

    for relative in os_release::PATHS {
        let path = root.join(relative);
        if let Some(contents) = read_optional(&path).map_err(|e| failed(&path, e))? {
            scan.namespace = os_release::parse_namespace(&contents);
            break;
        }
    }
    if scan.namespace.is_none() {
        scan.notes.push(Note::OsUnknown);
    }

    let status_path = root.join(dpkg::STATUS_PATH);
    match read_optional(&status_path).map_err(|e| failed(&status_path, e))? {
        Some(contents) => {
            let components = dpkg::parse_status(&contents);
            debug!(node, count = components.len(), "read dpkg database");
            scan.components.extend(components.into_iter().map(|c| match &scan.namespace {
                Some(ns) => c.with_namespace(ns.clone()),
                None => c,
            }));
        }
        None => scan.notes.push(Note::PackageDatabaseMissing),
    }

    for relative in PYTHON_ROOTS {
        let dir = root.join(relative);
        if !dir.is_dir() {
            continue;
        }
        // <lib>/pythonX.Y/site-packages/<dist>.dist-info/METADATA
        for entry in WalkDir::new(&dir).max_depth(4).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(relative_path) = path.strip_prefix(root) else {
                continue;
            };
            let relative_path = relative_path.to_string_lossy();
            if !entry.file_type().is_file() || !python::is_metadata_path(&relative_path) {
                continue;
            }
            if let Some(contents) = read_optional(path).map_err(|e| failed(path, e))? {
                scan.components
                    .extend(python::parse_metadata_file(&relative_path, &contents));
            }
        }
    }

    Ok(scan)
}

#[async_trait]
impl NodeInventorizer for HostScanner {
    async fn scan(&self, node: &str) -> Result<InventoryScan> {
        let node_owned = node.to_string();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_root(&node_owned, &root))
            .await
            .map_err(|e| Error::Scan {
                node: node.to_string(),
                reason: format!("host scan task failed: {}", e),
            })?
    }
}
