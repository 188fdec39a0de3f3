//! Core data types for components, vulnerabilities, and enrichment.
//!
//! - [`Component`] - A package discovered in a layer or on a host
//! - [`SourceType`] - The package database or manifest a component came from
//! - [`Severity`] - Qualitative severity band derived from CVSS scores
//! - [`Vulnerability`] - A matched vulnerability with its enrichments
//!
//! # Example
//!
//! ```
//! use layerscan::model::{Component, SourceType};
//!
//! let component = Component::new("openssl", "3.0.11-1~deb12u2", SourceType::Dpkg)
//!     .with_namespace("debian:12");
//!
//! assert_eq!(component.namespace.as_deref(), Some("debian:12"));
//! ```

mod component;
mod vulnerability;

pub use component::*;
pub use vulnerability::*;
