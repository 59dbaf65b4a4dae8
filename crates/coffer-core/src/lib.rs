//! Coffer Core Library
//!
//! Core types, errors, configuration and utilities shared by every Coffer crate.

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::CofferConfig;
pub use error::{Error, Result};

/// Coffer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default S3 region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Maximum size of a single PUT or a single part (5 GiB)
pub const MAX_PUT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// Minimum size of every part but the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Upper bound for max-keys, max-parts and max-uploads
pub const MAX_LIST_ENTRIES: usize = 1000;

/// Maximum bucket name length
pub const MAX_BUCKET_NAME_LENGTH: usize = 63;

/// Minimum bucket name length
pub const MIN_BUCKET_NAME_LENGTH: usize = 3;

/// Maximum object key length
pub const MAX_KEY_LENGTH: usize = 1024;
