//! Metadata storage for Coffer
//!
//! Bucket, object and upload-session bookkeeping behind the [`MetadataStore`]
//! trait, with an in-memory backend and a SQLite backend.

pub mod memory;
pub mod repository;
pub mod traits;

pub use memory::MemoryMetadataStore;
pub use repository::SqliteMetadataStore;
pub use traits::*;
