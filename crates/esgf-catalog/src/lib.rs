//! esgf-catalog - Federated search and download for ESGF-style archives.
//!
//! This crate fans a dataset query out across heterogeneous index services
//! (Solr REST, Globus Search, STAC), reconciles their records into a single
//! deduplicated catalog, and materializes the selection locally: files
//! already on disk are referenced in place, streaming URLs are verified and
//! returned, bulk transfers move batches between endpoints, and everything
//! else is downloaded over HTTPS in parallel with checksum verification and
//! adaptive host selection from a persisted rate history.
//!
//! # Example
//!
//! ```rust,no_run
//! use esgf_catalog::{Catalog, PathDictOptions, Query};
//!
//! #[tokio::main]
//! async fn main() -> esgf_catalog::Result<()> {
//!     let mut cat = Catalog::new()?;
//!     cat.search(
//!         Query::new()
//!             .facet("experiment_id", "historical")
//!             .facet("source_id", "CanESM5")
//!             .facet("variable_id", ["gpp", "mrso"]),
//!     )
//!     .await?;
//!     cat.remove_ensembles()?;
//!     let paths = cat.to_path_dict(None, PathDictOptions::default()).await?;
//!     for (key, files) in &paths {
//!         println!("{key}: {} file(s)", files.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod database;
pub mod download;
pub mod error;
pub mod index;
pub mod logging;
pub mod planner;
pub mod projects;
pub mod transfer;

// Re-export commonly used types
pub use catalog::{Catalog, ModelGroup, PathDictOptions, VariableInfo};
pub use config::{CacheExpiry, Config, ConfigPatch, RequestsCacheConfig};
pub use database::{HostRate, RateStore, RateWindow};
pub use error::{EsgfError, Result};
pub use index::types::{DatasetRecord, FileInfo, Query};
pub use index::IndexDriver;
pub use planner::{AccessPlan, AccessPlanner, PathOrUrl};
pub use projects::Project;
pub use transfer::{TaskStatus, TransferClient, TransferTask};
