//! Blob storage backends for Coffer
//!
//! The protocol core only talks to [`StorageBackend`]; which medium holds the
//! bytes is chosen at startup.

pub mod engine;

pub use engine::local::LocalStorage;
pub use engine::memory::MemoryStorage;
pub use engine::{collect_stream, ByteStream, StorageBackend, StoredBlob};
