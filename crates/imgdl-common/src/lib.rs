//! imgdl Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the imgdl workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the run-level error taxonomy and result type
//! - **Naming**: content-addressed identifiers for encoded images
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Types**: source rows, transformed images and persisted records
//!
//! # Example
//!
//! ```no_run
//! use imgdl_common::naming::ContentHash;
//!
//! let hash = ContentHash::of(b"jpeg bytes");
//! assert_eq!(hash.as_str().len(), 32);
//! ```

pub mod error;
pub mod logging;
pub mod naming;
pub mod types;

// Re-export commonly used types
pub use error::{ImgdlError, Result};
pub use naming::ContentHash;
pub use types::{Record, SourceRecord, TransformedImage};
