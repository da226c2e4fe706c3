//! Geotweets Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the geotweets workspace.
//!
//! # Overview
//!
//! - **Types**: the normalized actor/place/event rows and the schema
//!   capability descriptor that decides which optional columns exist
//! - **Error Handling**: common error and result types
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use geotweets_common::types::{SchemaCapabilities, SchemaVersion};
//!
//! let caps = SchemaCapabilities::for_version(SchemaVersion::Legacy);
//! assert!(!caps.media);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
