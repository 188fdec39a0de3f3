//! Node (host) inventories.
//!
//! A [`NodeInventorizer`] produces the list of packages installed on a node.
//! The real scan walks the host filesystem and is expensive, so it is
//! usually wrapped in a [`CachingScanner`] which reuses a recent result and
//! never runs more than one scan per node at a time.
//!
//! # Example
//!
//! ```no_run
//! use layerscan::nodeinventory::{CachingScanner, HostScanner, NodeInventorizer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> layerscan::Result<()> {
//!     let scanner = CachingScanner::builder(Arc::new(HostScanner::new("/host")))
//!         .cache_path("/cache/inventory-cache")
//!         .ttl(Duration::from_secs(3 * 3600))
//!         .build();
//!
//!     let scan = scanner.scan("node-a").await?;
//!     println!("Found {} components", scan.components.len());
//!     Ok(())
//! }
//! ```

pub mod caching;
pub mod host;

pub use caching::{CachingScanner, CachingScannerBuilder, DelayFn};
pub use host::HostScanner;

use crate::error::Result;
use crate::model::Component;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Caveats about the completeness of an inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Note {
    /// The operating system could not be identified, so OS packages carry
    /// no namespace.
    OsUnknown,
    /// No package database was found for the operating system.
    PackageDatabaseMissing,
}

impl Note {
    pub fn as_str(&self) -> &'static str {
        match self {
            Note::OsUnknown => "os_unknown",
            Note::PackageDatabaseMissing => "package_database_missing",
        }
    }
}

impl std::fmt::Display for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The packages found on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryScan {
    /// Namespace of the node's operating system, e.g. `ubuntu:22.04`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

/// Produces the inventory of a node.
#[async_trait]
pub trait NodeInventorizer: Send + Sync {
    async fn scan(&self, node: &str) -> Result<InventoryScan>;
}
