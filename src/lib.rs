//! Container layer and host package scanning.
//!
//! - [`imagefmt`] pulls manifest files out of image layers.
//! - [`analyzer`] turns those files into [`model::Component`]s.
//! - [`versionfmt`] compares versions per packaging ecosystem.
//! - [`vulnmdsrc`] enriches vulnerabilities with metadata such as NVD CVSS scores.
//! - [`nodeinventory`] inventories hosts, caching results per node.

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod error;
pub mod imagefmt;
pub mod logging;
pub mod matcher;
pub mod model;
pub mod nodeinventory;
pub mod output;
pub mod platform;
pub mod versionfmt;
pub mod vulnmdsrc;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{Component, Severity, SourceType, Vulnerability};
