//! Storage engine capability

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use coffer_core::types::StorageRef;
use coffer_core::Result;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;

/// Body bytes flowing into or out of a backend
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outcome of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub location: StorageRef,
    pub size: u64,
    /// MD5 hex digest of the bytes written
    pub md5: String,
}

/// Storage engine trait.
///
/// Every write lands at a fresh location and becomes visible only once the
/// whole stream has been persisted. A stream that yields an error leaves
/// nothing behind. Releasing a location that is already gone succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store object data
    async fn write_object(
        &self,
        bucket: &str,
        key: &str,
        data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<StoredBlob>;

    /// Stream stored data, optionally restricted to an inclusive byte range.
    ///
    /// A missing location yields [`coffer_core::Error::NoSuchKey`].
    async fn read_object(&self, location: &StorageRef, range: Option<(u64, u64)>)
        -> Result<ByteStream>;

    async fn delete_object(&self, location: &StorageRef) -> Result<()>;

    /// Store one multipart part
    async fn write_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<StoredBlob>;

    async fn delete_part(&self, location: &StorageRef) -> Result<()>;

    /// Assemble parts, in the given order, into a new object blob
    async fn concatenate_parts(
        &self,
        bucket: &str,
        key: &str,
        parts: &[StorageRef],
    ) -> Result<StoredBlob>;

    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Release bucket-level resources. Blobs are released individually and
    /// must survive this, since the name may already belong to a new bucket.
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

/// Drain a stream into memory
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::stream;

    pub fn stream_of(chunks: &[&[u8]]) -> ByteStream {
        let items: Vec<Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(items))
    }

    pub fn failing_stream(prefix: &[u8]) -> ByteStream {
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(prefix)),
            Err(coffer_core::Error::IncompleteBody),
        ];
        Box::pin(stream::iter(items))
    }
}
