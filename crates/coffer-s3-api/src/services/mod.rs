//! Operation logic behind the HTTP layer
//!
//! Services talk to the storage and metadata capabilities only through their
//! traits. Metadata is always written after the bytes it points at are
//! durable, and blobs that lose their metadata entry are released afterwards.

mod bucket;
mod multipart;
mod object;

pub use bucket::BucketService;
pub use multipart::{MultipartEngine, PartListing};
pub use object::{ObjectRead, ObjectService};

use coffer_core::types::StorageRef;
use coffer_storage::StorageBackend;
use tracing::warn;

/// Release a blob nothing points at any more; failures only leak space
pub(crate) async fn release_object(storage: &dyn StorageBackend, location: &StorageRef) {
    if let Err(e) = storage.delete_object(location).await {
        warn!("Failed to release object data {}: {}", location, e);
    }
}

pub(crate) async fn release_part(storage: &dyn StorageBackend, location: &StorageRef) {
    if let Err(e) = storage.delete_part(location).await {
        warn!("Failed to release part data {}: {}", location, e);
    }
}

/// Resolve a `Content-MD5` header into the hex digest the body must match
pub(crate) fn expected_md5(header: Option<&str>) -> coffer_core::Result<Option<String>> {
    match header {
        None => Ok(None),
        Some(value) => coffer_crypto::content_md5_to_hex(value)
            .map(Some)
            .ok_or(coffer_core::Error::InvalidDigest),
    }
}
